//! Domain models
//!
//! Rust structs for the documents the engine reads and writes.
//! Field names serialize in camelCase to match the stored documents.

use crate::config::{DEFAULT_FOLLOW_UP_COUNT, TEMP_ID_PREFIX};
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Outcome recorded for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallStatus {
    #[serde(rename = "Interested")]
    Interested,
    #[serde(rename = "Not Interested")]
    NotInterested,
    /// Legacy value kept readable for historical records. Never written.
    #[serde(rename = "Ringing")]
    Ringing,
    #[serde(rename = "Not Answered")]
    NotAnswered,
    #[serde(rename = "Call Back Later")]
    CallBackLater,
    #[serde(rename = "Details Share")]
    DetailsShare,
    #[serde(rename = "Booked")]
    Booked,
    #[serde(rename = "Site Visit Generated")]
    SiteVisitGenerated,
    #[serde(rename = "Second Site Visit")]
    SecondSiteVisit,
}

impl CallStatus {
    pub const ALL: [CallStatus; 9] = [
        CallStatus::Interested,
        CallStatus::NotInterested,
        CallStatus::Ringing,
        CallStatus::NotAnswered,
        CallStatus::CallBackLater,
        CallStatus::DetailsShare,
        CallStatus::Booked,
        CallStatus::SiteVisitGenerated,
        CallStatus::SecondSiteVisit,
    ];

    pub fn label(self) -> &'static str {
        match self {
            CallStatus::Interested => "Interested",
            CallStatus::NotInterested => "Not Interested",
            CallStatus::Ringing => "Ringing",
            CallStatus::NotAnswered => "Not Answered",
            CallStatus::CallBackLater => "Call Back Later",
            CallStatus::DetailsShare => "Details Share",
            CallStatus::Booked => "Booked",
            CallStatus::SiteVisitGenerated => "Site Visit Generated",
            CallStatus::SecondSiteVisit => "Second Site Visit",
        }
    }

    /// Whether new or updated records may carry this status.
    pub fn is_writable(self) -> bool {
        self != CallStatus::Ringing
    }

    /// Ringing and NotAnswered both count as unanswered.
    pub fn is_answered(self) -> bool {
        !matches!(self, CallStatus::NotAnswered | CallStatus::Ringing)
    }

    /// Positive outcomes counted as interest.
    pub fn is_interested(self) -> bool {
        matches!(
            self,
            CallStatus::Interested
                | CallStatus::DetailsShare
                | CallStatus::Booked
                | CallStatus::SiteVisitGenerated
                | CallStatus::SecondSiteVisit
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CallStatus {
    type Err = AppError;

    /// Exact, case-insensitive match on the display label.
    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        CallStatus::ALL
            .iter()
            .copied()
            .find(|status| status.label().to_lowercase() == wanted)
            .ok_or_else(|| AppError::Validation(format!("Unknown status: {}", s)))
    }
}

/// A shared workspace that call logs belong to by foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Logical clock for staleness comparison, touched by every scoped mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// A single client interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub caller_name: String,
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_phone: Option<String>,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
    /// Present only while a callback reminder is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub follow_up_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_won: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_junk: bool,
}

impl CallLog {
    /// Optimistic entry not yet confirmed by the store.
    pub fn is_unconfirmed(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// The callback instant this record is waiting on, if it should raise a reminder.
    pub fn pending_callback(&self) -> Option<DateTime<Utc>> {
        if self.is_junk || self.status != CallStatus::CallBackLater {
            return None;
        }
        self.callback_time
    }
}

/// Input for a new call log. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCallLog {
    pub project_id: String,
    pub caller_name: String,
    pub client_name: String,
    pub client_phone: Option<String>,
    pub status: CallStatus,
    /// Defaults to the time of the write.
    pub timestamp: Option<DateTime<Utc>>,
    pub callback_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub follow_up_count: Option<u32>,
    pub visit_won: Option<bool>,
    pub is_junk: bool,
}

impl NewCallLog {
    pub fn new(
        project_id: impl Into<String>,
        caller_name: impl Into<String>,
        client_name: impl Into<String>,
        status: CallStatus,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            caller_name: caller_name.into(),
            client_name: client_name.into(),
            client_phone: None,
            status,
            timestamp: None,
            callback_time: None,
            notes: None,
            follow_up_count: None,
            visit_won: None,
            is_junk: false,
        }
    }

    pub fn with_callback(mut self, at: DateTime<Utc>) -> Self {
        self.callback_time = Some(at);
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(AppError::Validation("Record has no project".to_string()));
        }
        if self.client_name.trim().is_empty() {
            return Err(AppError::Validation("Client name is required".to_string()));
        }
        if !self.status.is_writable() {
            return Err(AppError::Validation(format!(
                "Status '{}' is retained for history only",
                self.status
            )));
        }
        if self.status == CallStatus::CallBackLater && self.callback_time.is_none() {
            return Err(AppError::Validation(
                "A callback time is required for Call Back Later".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the stored form. A callback time survives only on CallBackLater.
    pub fn into_call_log(self, id: String, now: DateTime<Utc>) -> CallLog {
        let callback_time = match self.status {
            CallStatus::CallBackLater => self.callback_time,
            _ => None,
        };

        CallLog {
            id,
            project_id: self.project_id,
            caller_name: self.caller_name.trim().to_string(),
            client_name: self.client_name.trim().to_string(),
            client_phone: non_blank(self.client_phone),
            status: self.status,
            timestamp: self.timestamp.unwrap_or(now),
            callback_time,
            notes: non_blank(self.notes),
            follow_up_count: self.follow_up_count.unwrap_or(DEFAULT_FOLLOW_UP_COUNT),
            visit_won: self.visit_won,
            is_junk: self.is_junk,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Tri-state edit of an optional field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    /// `None` clears the field.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Clear,
        }
    }
}

/// Partial update of a call log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLogUpdate {
    pub status: Option<CallStatus>,
    pub timestamp: Option<DateTime<Utc>>,
    pub follow_up_count: Option<u32>,
    pub is_junk: Option<bool>,
    pub client_phone: FieldUpdate<String>,
    pub callback_time: FieldUpdate<DateTime<Utc>>,
    pub notes: FieldUpdate<String>,
    pub visit_won: FieldUpdate<bool>,
}

impl CallLogUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Moving to any status other than CallBackLater drops the callback time.
    pub fn normalized(mut self) -> Self {
        if let Some(status) = self.status {
            if status != CallStatus::CallBackLater {
                self.callback_time = FieldUpdate::Clear;
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.timestamp.is_none()
            && self.follow_up_count.is_none()
            && self.is_junk.is_none()
            && self.client_phone.is_keep()
            && self.callback_time.is_keep()
            && self.notes.is_keep()
            && self.visit_won.is_keep()
    }
}

/// Aggregates for one caller (or a whole project) over one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerStats {
    pub total_calls: u32,
    pub answered_calls: u32,
    pub interested_clients: u32,
    pub not_interested_clients: u32,
}

/// Manual correction of computed aggregates. Absent keys use the computed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interested_clients: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_interested_clients: Option<u32>,
}

impl StatOverride {
    pub fn is_empty(&self) -> bool {
        self.total_calls.is_none()
            && self.answered_calls.is_none()
            && self.interested_clients.is_none()
            && self.not_interested_clients.is_none()
    }
}

/// All caller overrides for one project on one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyOverrides {
    #[serde(default)]
    pub id: String,
    pub project_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub callers: BTreeMap<String, StatOverride>,
}

impl DailyOverrides {
    pub fn doc_id(project_id: &str, date: NaiveDate) -> String {
        format!("{}_{}", project_id, date.format("%Y-%m-%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_status_labels_round_trip_through_serde() {
        let json = serde_json::to_string(&CallStatus::CallBackLater).unwrap();
        assert_eq!(json, "\"Call Back Later\"");

        let parsed: CallStatus = serde_json::from_str("\"Not Answered\"").unwrap();
        assert_eq!(parsed, CallStatus::NotAnswered);
    }

    #[test]
    fn test_status_from_str_is_case_insensitive() {
        assert_eq!("call back later".parse::<CallStatus>().unwrap(), CallStatus::CallBackLater);
        assert_eq!("  BOOKED ".parse::<CallStatus>().unwrap(), CallStatus::Booked);
        assert!("call back".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_ringing_is_not_writable() {
        let log = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Ringing);
        assert!(matches!(log.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_call_back_later_requires_time() {
        let bare = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::CallBackLater);
        assert!(matches!(bare.validate(), Err(AppError::Validation(_))));

        let timed = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::CallBackLater)
            .with_callback(now() + chrono::Duration::hours(1));
        assert!(timed.validate().is_ok());
    }

    #[test]
    fn test_callback_dropped_unless_call_back_later() {
        let at = now() + chrono::Duration::hours(2);

        let kept = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::CallBackLater)
            .with_callback(at)
            .into_call_log("id-1".into(), now());
        assert_eq!(kept.callback_time, Some(at));
        assert_eq!(kept.follow_up_count, DEFAULT_FOLLOW_UP_COUNT);
        assert_eq!(kept.timestamp, now());

        let dropped = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested)
            .with_callback(at)
            .into_call_log("id-2".into(), now());
        assert_eq!(dropped.callback_time, None);
    }

    #[test]
    fn test_update_normalization_clears_callback() {
        let update = CallLogUpdate {
            status: Some(CallStatus::Interested),
            callback_time: FieldUpdate::Set(now()),
            ..CallLogUpdate::default()
        }
        .normalized();
        assert_eq!(update.callback_time, FieldUpdate::Clear);

        let kept = CallLogUpdate {
            status: Some(CallStatus::CallBackLater),
            callback_time: FieldUpdate::Set(now()),
            ..CallLogUpdate::default()
        }
        .normalized();
        assert_eq!(kept.callback_time, FieldUpdate::Set(now()));
    }

    #[test]
    fn test_call_log_json_shape() {
        let log = NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested)
            .into_call_log("id-1".into(), now());
        let value = serde_json::to_value(&log).unwrap();

        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["status"], "Interested");
        assert!(value.get("callbackTime").is_none());
        assert!(value.get("isJunk").is_none());
    }
}
