//! In-memory mirror of the subscribed record set
//!
//! Confirmed records are replaced wholesale by each store snapshot.
//! Optimistic entries live in a separate overlay keyed by temporary id and
//! are only removed by the mutator that created them. Every change bumps a
//! revision so reactive consumers can re-derive their state.

use crate::models::{CallLog, CallStatus, DailyOverrides, Project};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

pub struct RecordCache {
    projects: Vec<Project>,
    /// Project whose records are currently mirrored.
    project_id: Option<String>,
    confirmed: HashMap<String, CallLog>,
    optimistic: BTreeMap<String, CallLog>,
    overrides: BTreeMap<NaiveDate, DailyOverrides>,
    revision: watch::Sender<u64>,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            projects: Vec::new(),
            project_id: None,
            confirmed: HashMap::new(),
            optimistic: BTreeMap::new(),
            overrides: BTreeMap::new(),
            revision,
        }
    }

    /// Receiver that changes on every cache mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    // ===== Projects =====

    pub fn replace_projects(&mut self, projects: Vec<Project>) {
        self.projects = projects;
        self.bump();
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    // ===== Call logs =====

    /// Start mirroring another project. Confirmed records and overrides are dropped.
    pub fn switch_project(&mut self, project_id: &str) {
        self.project_id = Some(project_id.to_string());
        self.confirmed.clear();
        self.overrides.clear();
        self.bump();
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Replace every confirmed record of the mirrored project.
    pub fn replace_call_logs(&mut self, logs: Vec<CallLog>) {
        self.confirmed = logs.into_iter().map(|log| (log.id.clone(), log)).collect();
        self.bump();
    }

    pub fn insert_optimistic(&mut self, log: CallLog) {
        tracing::debug!("Optimistic insert {}", log.id);
        self.optimistic.insert(log.id.clone(), log);
        self.bump();
    }

    pub fn remove_optimistic(&mut self, temp_id: &str) -> Option<CallLog> {
        let removed = self.optimistic.remove(temp_id);
        if removed.is_some() {
            tracing::debug!("Rolled back optimistic entry {}", temp_id);
            self.bump();
        }
        removed
    }

    /// Replace an optimistic entry with its store-confirmed form.
    ///
    /// The confirmed record stays until the next snapshot replaces it.
    pub fn promote(&mut self, temp_id: &str, committed: CallLog) {
        self.optimistic.remove(temp_id);
        if self.project_id.as_deref() == Some(committed.project_id.as_str()) {
            self.confirmed.insert(committed.id.clone(), committed);
        }
        self.bump();
    }

    pub fn optimistic_len(&self) -> usize {
        self.optimistic.len()
    }

    pub fn get(&self, id: &str) -> Option<&CallLog> {
        self.confirmed.get(id).or_else(|| self.optimistic.get(id))
    }

    /// Records of the mirrored project, newest first, optimistic entries included.
    pub fn call_logs(&self) -> Vec<CallLog> {
        let Some(project_id) = self.project_id.as_deref() else {
            return Vec::new();
        };

        let mut logs: Vec<CallLog> = self
            .confirmed
            .values()
            .chain(self.optimistic.values())
            .filter(|log| log.project_id == project_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        logs
    }

    /// Non-junk records with a callback still ahead of `now`, soonest first.
    pub fn upcoming_callbacks(&self, now: DateTime<Utc>) -> Vec<CallLog> {
        let mut upcoming: Vec<CallLog> = self
            .call_logs()
            .into_iter()
            .filter(|log| !log.is_junk && log.callback_time.is_some_and(|at| at > now))
            .collect();
        upcoming.sort_by_key(|log| log.callback_time);
        upcoming
    }

    /// Records still waiting on shared details.
    pub fn pending_follow_ups(&self) -> Vec<CallLog> {
        self.call_logs()
            .into_iter()
            .filter(|log| log.status == CallStatus::DetailsShare)
            .collect()
    }

    // ===== Stat overrides =====

    pub fn replace_overrides(&mut self, overrides: Vec<DailyOverrides>) {
        self.overrides = overrides.into_iter().map(|o| (o.date, o)).collect();
        self.bump();
    }

    pub fn overrides_for(&self, date: NaiveDate) -> Option<&DailyOverrides> {
        self.overrides.get(&date)
    }
}
