//! Daily statistics
//!
//! Aggregates call logs per UTC calendar day, overall and per caller, and
//! reconciles manual overrides against the computed values. Junk records
//! never count.

use crate::models::{CallLog, CallerStats, DailyOverrides, StatOverride};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Computed and effective stats of one caller on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerDay {
    pub caller_name: String,
    pub computed: CallerStats,
    /// Computed values with any overrides applied.
    pub stats: CallerStats,
    pub overridden: StatOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: NaiveDate,
    pub stats: CallerStats,
}

fn count(stats: &mut CallerStats, log: &CallLog) {
    stats.total_calls += 1;
    if log.status.is_answered() {
        stats.answered_calls += 1;
    }
    if log.status.is_interested() {
        stats.interested_clients += 1;
    }
    if log.status == crate::models::CallStatus::NotInterested {
        stats.not_interested_clients += 1;
    }
}

fn on_day(log: &CallLog, date: NaiveDate) -> bool {
    !log.is_junk && log.timestamp.date_naive() == date
}

/// Project-wide totals for `date`.
pub fn daily_summary(logs: &[CallLog], date: NaiveDate) -> CallerStats {
    let mut stats = CallerStats::default();
    for log in logs.iter().filter(|log| on_day(log, date)) {
        count(&mut stats, log);
    }
    stats
}

/// Computed stats per caller for `date`, sorted by caller name.
/// Records without a caller name are left out.
pub fn caller_breakdown(logs: &[CallLog], date: NaiveDate) -> BTreeMap<String, CallerStats> {
    let mut callers: BTreeMap<String, CallerStats> = BTreeMap::new();
    for log in logs.iter().filter(|log| on_day(log, date)) {
        let name = log.caller_name.trim();
        if name.is_empty() {
            continue;
        }
        count(callers.entry(name.to_string()).or_default(), log);
    }
    callers
}

/// Each overridden value replaces its computed counterpart.
pub fn effective_stats(computed: CallerStats, overridden: &StatOverride) -> CallerStats {
    CallerStats {
        total_calls: overridden.total_calls.unwrap_or(computed.total_calls),
        answered_calls: overridden.answered_calls.unwrap_or(computed.answered_calls),
        interested_clients: overridden
            .interested_clients
            .unwrap_or(computed.interested_clients),
        not_interested_clients: overridden
            .not_interested_clients
            .unwrap_or(computed.not_interested_clients),
    }
}

/// Keep only the desired values that differ from the computed ones.
pub fn reconcile_override(computed: CallerStats, desired: CallerStats) -> StatOverride {
    let differs = |want: u32, have: u32| (want != have).then_some(want);
    StatOverride {
        total_calls: differs(desired.total_calls, computed.total_calls),
        answered_calls: differs(desired.answered_calls, computed.answered_calls),
        interested_clients: differs(desired.interested_clients, computed.interested_clients),
        not_interested_clients: differs(
            desired.not_interested_clients,
            computed.not_interested_clients,
        ),
    }
}

/// Store `overridden` for `caller`, dropping the entry when nothing is overridden.
pub fn apply_override(day: &mut DailyOverrides, caller: &str, overridden: StatOverride) {
    let caller = caller.trim().to_string();
    if overridden.is_empty() {
        day.callers.remove(&caller);
    } else {
        day.callers.insert(caller, overridden);
    }
}

/// Per-caller rows for `date` with overrides applied.
pub fn caller_days(
    logs: &[CallLog],
    date: NaiveDate,
    overrides: Option<&DailyOverrides>,
) -> Vec<CallerDay> {
    caller_breakdown(logs, date)
        .into_iter()
        .map(|(caller_name, computed)| {
            let overridden = overrides
                .and_then(|day| day.callers.get(&caller_name))
                .copied()
                .unwrap_or_default();
            CallerDay {
                stats: effective_stats(computed, &overridden),
                caller_name,
                computed,
                overridden,
            }
        })
        .collect()
}

/// Totals for each past day with activity, newest first. `today` is excluded.
pub fn history(logs: &[CallLog], today: NaiveDate) -> Vec<DaySummary> {
    let mut days: BTreeMap<NaiveDate, CallerStats> = BTreeMap::new();
    for log in logs.iter().filter(|log| !log.is_junk) {
        let date = log.timestamp.date_naive();
        if date < today {
            count(days.entry(date).or_default(), log);
        }
    }

    days.into_iter()
        .rev()
        .map(|(date, stats)| DaySummary { date, stats })
        .collect()
}
