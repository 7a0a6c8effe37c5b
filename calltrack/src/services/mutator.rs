//! Optimistic mutator
//!
//! Every write to the store passes through here. Adds become visible in
//! the cache before the store confirms them and are rolled back if the
//! write fails; updates and deletes wait for the store and reach the cache
//! through the next snapshot. Successful writes touch the owning project's
//! `lastActivityAt` in the background.

use crate::cache::RecordCache;
use crate::clock::Clock;
use crate::config::{DEFAULT_PROJECT_NAME, MAX_PROJECT_NAME_LENGTH, TEMP_ID_PREFIX};
use crate::error::{AppError, Result};
use crate::models::{
    CallLog, CallLogUpdate, CallStatus, DailyOverrides, FieldUpdate, NewCallLog, Project,
};
use crate::store::{to_fields, Collection, FieldPatch, NewDocument, Patch, RemoteStore, WriteOp};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outcome of a batch add.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Records written, with store-assigned ids, in input order.
    pub committed: Vec<CallLog>,
    /// Input index and reason for each record refused before writing.
    pub rejected: Vec<(usize, String)>,
}

#[derive(Clone)]
pub struct OptimisticMutator {
    store: Arc<dyn RemoteStore>,
    cache: Arc<RwLock<RecordCache>>,
    clock: Arc<dyn Clock>,
    access_blocked: Arc<watch::Sender<bool>>,
}

impl OptimisticMutator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<RwLock<RecordCache>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (access_blocked, _) = watch::channel(false);
        Self {
            store,
            cache,
            clock,
            access_blocked: Arc::new(access_blocked),
        }
    }

    /// Set once the store has refused a write under its access rules.
    pub fn access_blocked(&self) -> watch::Receiver<bool> {
        self.access_blocked.subscribe()
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_permission_denied() {
                tracing::error!("Store refused write: {}", e);
                self.access_blocked.send_replace(true);
            }
        }
        result
    }

    fn temp_id() -> String {
        format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple())
    }

    // ===== Call logs =====

    /// Add a record, visible in the cache immediately.
    pub async fn add(&self, new: NewCallLog) -> Result<CallLog> {
        new.validate()?;

        let temp_id = Self::temp_id();
        let pending = new.into_call_log(temp_id.clone(), self.clock.now());
        let fields = to_fields(&pending)?;

        self.cache.write().await.insert_optimistic(pending.clone());

        let result = self
            .store
            .put(Collection::CallLogs, NewDocument::new(fields))
            .await;

        match self.observe(result) {
            Ok(id) => {
                let committed = CallLog { id, ..pending };
                self.cache.write().await.promote(&temp_id, committed.clone());
                tracing::info!("Call log {} committed", committed.id);
                self.touch(&committed.project_id);
                Ok(committed)
            }
            Err(e) => {
                self.cache.write().await.remove_optimistic(&temp_id);
                tracing::warn!("Call log add failed, rolled back {}: {}", temp_id, e);
                Err(e)
            }
        }
    }

    /// Patch a confirmed record. Leaving CallBackLater clears the callback time.
    pub async fn update(&self, id: &str, update: CallLogUpdate) -> Result<()> {
        if id.starts_with(TEMP_ID_PREFIX) {
            return Err(AppError::Validation(format!(
                "Record {} is not confirmed yet",
                id
            )));
        }
        if let Some(status) = update.status {
            if !status.is_writable() {
                return Err(AppError::Validation(format!(
                    "Status '{}' is retained for history only",
                    status
                )));
            }
        }

        let update = update.normalized();
        let cached = self.cache.read().await.get(id).cloned();

        if update.status.is_none() && matches!(update.callback_time, FieldUpdate::Set(_)) {
            if let Some(log) = &cached {
                if log.status != CallStatus::CallBackLater {
                    return Err(AppError::Validation(
                        "A callback time needs the Call Back Later status".to_string(),
                    ));
                }
            }
        }

        let next_status = update.status.or(cached.as_ref().map(|log| log.status));
        let leaves_no_callback = match &update.callback_time {
            FieldUpdate::Clear => true,
            FieldUpdate::Set(_) => false,
            FieldUpdate::Keep => cached.as_ref().is_some_and(|log| log.callback_time.is_none()),
        };
        if next_status == Some(CallStatus::CallBackLater) && leaves_no_callback {
            return Err(AppError::Validation(
                "A callback time is required for Call Back Later".to_string(),
            ));
        }

        let patch = update_patch(&update)?;
        if patch.is_empty() {
            return Ok(());
        }

        let result = self.store.update(Collection::CallLogs, id, patch).await;
        self.observe(result)?;
        tracing::debug!("Call log {} updated", id);

        if let Some(project_id) = self.owning_project(cached.as_ref()).await {
            self.touch(&project_id);
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if id.starts_with(TEMP_ID_PREFIX) {
            return Err(AppError::Validation(format!(
                "Record {} is not confirmed yet",
                id
            )));
        }

        let cached = self.cache.read().await.get(id).cloned();
        let result = self.store.delete(Collection::CallLogs, id).await;
        self.observe(result)?;
        tracing::info!("Call log {} deleted", id);

        if let Some(project_id) = self.owning_project(cached.as_ref()).await {
            self.touch(&project_id);
        }
        Ok(())
    }

    /// Write many records in one store batch.
    ///
    /// Invalid records are reported and skipped; the rest are written
    /// together and each distinct project is touched once.
    pub async fn batch_add(&self, records: Vec<NewCallLog>) -> Result<BatchResult> {
        let now = self.clock.now();
        let mut result = BatchResult::default();
        let mut pending = Vec::new();

        for (index, record) in records.into_iter().enumerate() {
            match record.validate() {
                Ok(()) => pending.push(record.into_call_log(Self::temp_id(), now)),
                Err(e) => result.rejected.push((index, e.to_string())),
            }
        }

        if pending.is_empty() {
            return Ok(result);
        }

        let mut ops = Vec::with_capacity(pending.len());
        for log in &pending {
            ops.push(WriteOp::Put {
                collection: Collection::CallLogs,
                doc: NewDocument::new(to_fields(log)?),
            });
        }

        {
            let mut cache = self.cache.write().await;
            for log in &pending {
                cache.insert_optimistic(log.clone());
            }
        }

        let written = self.store.batch_write(ops).await;
        let ids = match self.observe(written) {
            Ok(ids) => ids,
            Err(e) => {
                let mut cache = self.cache.write().await;
                for log in &pending {
                    cache.remove_optimistic(&log.id);
                }
                tracing::warn!("Batch of {} records failed: {}", pending.len(), e);
                return Err(e);
            }
        };

        let mut projects = BTreeSet::new();
        {
            let mut cache = self.cache.write().await;
            for (log, id) in pending.into_iter().zip(ids) {
                let temp_id = log.id.clone();
                let committed = CallLog {
                    id: id.unwrap_or_else(|| temp_id.clone()),
                    ..log
                };
                cache.promote(&temp_id, committed.clone());
                projects.insert(committed.project_id.clone());
                result.committed.push(committed);
            }
        }

        tracing::info!("Batch committed {} records", result.committed.len());
        for project_id in projects {
            self.touch(&project_id);
        }
        Ok(result)
    }

    async fn owning_project(&self, cached: Option<&CallLog>) -> Option<String> {
        match cached {
            Some(log) => Some(log.project_id.clone()),
            None => self.cache.read().await.project_id().map(str::to_string),
        }
    }

    // ===== Projects =====

    /// Advance a project's `lastActivityAt` without waiting for the store.
    ///
    /// Failures are logged only; staleness detection tolerates a missed touch.
    pub fn touch(&self, project_id: &str) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let project_id = project_id.to_string();
        let patch = Patch::from([(
            "lastActivityAt".to_string(),
            FieldPatch::Set(timestamp_value(self.clock.now())),
        )]);

        tokio::spawn(async move {
            match store.update(Collection::Projects, &project_id, patch).await {
                Ok(()) => tracing::debug!("Touched project {}", project_id),
                Err(e) => tracing::warn!("Failed to touch project {}: {}", project_id, e),
            }
        })
    }

    pub async fn add_project(&self, name: &str) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Project name is required".to_string()));
        }
        if name.chars().count() > MAX_PROJECT_NAME_LENGTH {
            return Err(AppError::Validation(format!(
                "Project name exceeds {} characters",
                MAX_PROJECT_NAME_LENGTH
            )));
        }

        let mut project = Project {
            id: String::new(),
            name: name.to_string(),
            last_activity_at: Some(self.clock.now()),
        };
        let result = self
            .store
            .put(Collection::Projects, NewDocument::new(to_fields(&project)?))
            .await;
        project.id = self.observe(result)?;

        tracing::info!("Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    /// Delete a project. The last remaining project cannot be deleted.
    ///
    /// Call logs keep their `projectId`; nothing cascades.
    pub async fn delete_project(&self, id: &str) -> Result<()> {
        if self.cache.read().await.projects().len() <= 1 {
            return Err(AppError::Validation(
                "You cannot delete the last project".to_string(),
            ));
        }

        let result = self.store.delete(Collection::Projects, id).await;
        self.observe(result)?;
        tracing::info!("Deleted project {}", id);
        Ok(())
    }

    /// Create the fallback project used when the store holds none.
    pub async fn ensure_default_project(&self) -> Result<Project> {
        tracing::info!("No projects found, creating '{}'", DEFAULT_PROJECT_NAME);
        self.add_project(DEFAULT_PROJECT_NAME).await
    }

    // ===== Stat overrides =====

    /// Store a day's caller overrides; a day without overrides is deleted.
    pub async fn write_stat_overrides(&self, overrides: DailyOverrides) -> Result<()> {
        let id = DailyOverrides::doc_id(&overrides.project_id, overrides.date);

        let result = if overrides.callers.is_empty() {
            match self.store.delete(Collection::StatOverrides, &id).await {
                Err(AppError::NotFound(_)) => Ok(()),
                other => other,
            }
        } else {
            let doc = NewDocument::with_id(id.clone(), to_fields(&overrides)?);
            self.store
                .put(Collection::StatOverrides, doc)
                .await
                .map(|_| ())
        };
        self.observe(result)?;

        tracing::debug!("Stored stat overrides {}", id);
        self.touch(&overrides.project_id);
        Ok(())
    }
}

fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn patch_value<T: Serialize>(value: &T) -> Result<FieldPatch> {
    Ok(FieldPatch::Set(serde_json::to_value(value)?))
}

fn field_patch<T: Serialize>(
    patch: &mut Patch,
    field: &str,
    update: &FieldUpdate<T>,
) -> Result<()> {
    match update {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(value) => {
            patch.insert(field.to_string(), patch_value(value)?);
        }
        FieldUpdate::Clear => {
            patch.insert(field.to_string(), FieldPatch::Delete);
        }
    }
    Ok(())
}

/// Translate a record update into a store patch.
pub fn update_patch(update: &CallLogUpdate) -> Result<Patch> {
    let mut patch = Patch::new();

    if let Some(status) = &update.status {
        patch.insert("status".to_string(), patch_value(status)?);
    }
    if let Some(timestamp) = update.timestamp {
        patch.insert("timestamp".to_string(), FieldPatch::Set(timestamp_value(timestamp)));
    }
    if let Some(count) = &update.follow_up_count {
        patch.insert("followUpCount".to_string(), patch_value(count)?);
    }
    if let Some(is_junk) = &update.is_junk {
        patch.insert("isJunk".to_string(), patch_value(is_junk)?);
    }
    field_patch(&mut patch, "clientPhone", &update.client_phone)?;
    field_patch(&mut patch, "notes", &update.notes)?;
    field_patch(&mut patch, "visitWon", &update.visit_won)?;
    match &update.callback_time {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(at) => {
            patch.insert("callbackTime".to_string(), FieldPatch::Set(timestamp_value(*at)));
        }
        FieldUpdate::Clear => {
            patch.insert("callbackTime".to_string(), FieldPatch::Delete);
        }
    }

    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::InstantClock;
    use crate::store::{Availability, MemoryStore, Query};
    use chrono::TimeZone;
    use serde_json::json;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()
    }

    async fn create_test_mutator() -> (OptimisticMutator, Arc<MemoryStore>, Arc<RwLock<RecordCache>>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RwLock::new(RecordCache::new()));
        cache.write().await.switch_project("p1");
        let mutator = OptimisticMutator::new(
            store.clone(),
            cache.clone(),
            InstantClock::shared(base_time()),
        );
        (mutator, store, cache)
    }

    async fn seed_project(store: &MemoryStore, id: &str) {
        store
            .put(
                Collection::Projects,
                NewDocument::with_id(id, to_fields(&json!({"name": id})).unwrap()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_commits_and_promotes() {
        let (mutator, store, cache) = create_test_mutator().await;
        seed_project(&store, "p1").await;

        let log = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap();

        assert!(!log.is_unconfirmed());
        assert!(store.get(Collection::CallLogs, &log.id).is_some());

        let cache = cache.read().await;
        assert_eq!(cache.optimistic_len(), 0);
        assert_eq!(cache.get(&log.id), Some(&log));
    }

    #[tokio::test]
    async fn test_failed_add_rolls_back() {
        let (mutator, store, cache) = create_test_mutator().await;
        let before = cache.read().await.call_logs();
        store.set_availability(Availability::Offline);

        let err = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(cache.read().await.call_logs(), before);
        assert_eq!(cache.read().await.optimistic_len(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_sets_access_blocked() {
        let (mutator, store, _cache) = create_test_mutator().await;
        let blocked = mutator.access_blocked();
        store.set_availability(Availability::Denied);

        let err = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap_err();

        assert!(err.is_permission_denied());
        assert!(*blocked.borrow());
    }

    #[tokio::test]
    async fn test_update_away_from_callback_clears_time() {
        let (mutator, store, _cache) = create_test_mutator().await;
        let log = mutator
            .add(
                NewCallLog::new("p1", "Asha", "Ravi", CallStatus::CallBackLater)
                    .with_callback(base_time() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        // The caller asks to keep a callback time; the status change wins.
        let update = CallLogUpdate {
            status: Some(CallStatus::Booked),
            callback_time: FieldUpdate::Set(base_time() + chrono::Duration::hours(5)),
            ..CallLogUpdate::default()
        };
        mutator.update(&log.id, update).await.unwrap();

        let stored: CallLog = store
            .get(Collection::CallLogs, &log.id)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(stored.status, CallStatus::Booked);
        assert_eq!(stored.callback_time, None);
    }

    #[tokio::test]
    async fn test_call_back_later_needs_a_time() {
        let (mutator, store, _cache) = create_test_mutator().await;

        let bare = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::CallBackLater))
            .await;
        assert!(matches!(bare, Err(AppError::Validation(_))));

        let log = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap();
        let cleared = CallLogUpdate {
            status: Some(CallStatus::CallBackLater),
            callback_time: FieldUpdate::Clear,
            ..CallLogUpdate::default()
        };
        assert!(matches!(
            mutator.update(&log.id, cleared).await,
            Err(AppError::Validation(_))
        ));

        let stored: CallLog = store
            .get(Collection::CallLogs, &log.id)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(stored.status, CallStatus::Interested);
    }

    #[tokio::test]
    async fn test_update_rejects_ringing_and_temp_ids() {
        let (mutator, _store, _cache) = create_test_mutator().await;

        let ringing = mutator
            .update("abc", CallLogUpdate::status(CallStatus::Ringing))
            .await;
        assert!(matches!(ringing, Err(AppError::Validation(_))));

        let temp = mutator
            .update("local-123", CallLogUpdate::status(CallStatus::Booked))
            .await;
        assert!(matches!(temp, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_cache_unchanged() {
        let (mutator, store, cache) = create_test_mutator().await;
        let log = mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap();
        let before = cache.read().await.call_logs();

        store.set_availability(Availability::Offline);
        let result = mutator
            .update(&log.id, CallLogUpdate::status(CallStatus::Booked))
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(cache.read().await.call_logs(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_write_touches_project() {
        let (mutator, store, _cache) = create_test_mutator().await;
        seed_project(&store, "p1").await;

        mutator
            .add(NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested))
            .await
            .unwrap();
        mutator.touch("p1").await.unwrap();

        let project: Project = store
            .get(Collection::Projects, "p1")
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(project.last_activity_at, Some(base_time()));
    }

    #[tokio::test]
    async fn test_failed_touch_is_not_surfaced() {
        let (mutator, _store, _cache) = create_test_mutator().await;
        // Project does not exist: the touch fails and is only logged.
        mutator.touch("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_add_single_write() {
        let (mutator, store, cache) = create_test_mutator().await;

        let records = vec![
            NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested),
            NewCallLog::new("p1", "Asha", "", CallStatus::Interested),
            NewCallLog::new("p1", "Asha", "Meera", CallStatus::Booked),
        ];
        let result = mutator.batch_add(records).await.unwrap();

        assert_eq!(result.committed.len(), 2);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].0, 1);

        let stats = store.write_stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.batched_ops, 2);
        assert_eq!(cache.read().await.optimistic_len(), 0);
        assert_eq!(
            store
                .read(Query::all(Collection::CallLogs))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_every_entry() {
        let (mutator, store, cache) = create_test_mutator().await;
        store.set_availability(Availability::Offline);

        let records = vec![
            NewCallLog::new("p1", "Asha", "Ravi", CallStatus::Interested),
            NewCallLog::new("p1", "Asha", "Meera", CallStatus::Booked),
        ];
        assert!(mutator.batch_add(records).await.is_err());
        assert!(cache.read().await.call_logs().is_empty());
    }

    #[tokio::test]
    async fn test_last_project_cannot_be_deleted() {
        let (mutator, _store, cache) = create_test_mutator().await;
        let project = mutator.add_project("Only").await.unwrap();
        cache.write().await.replace_projects(vec![project.clone()]);

        let err = mutator.delete_project(&project.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_update_patch_shape() {
        let update = CallLogUpdate {
            status: Some(CallStatus::Interested),
            notes: FieldUpdate::Set("Spoke to spouse".to_string()),
            client_phone: FieldUpdate::Clear,
            ..CallLogUpdate::default()
        }
        .normalized();

        let patch = update_patch(&update).unwrap();
        assert_eq!(patch["status"], FieldPatch::Set(json!("Interested")));
        assert_eq!(patch["notes"], FieldPatch::Set(json!("Spoke to spouse")));
        assert_eq!(patch["clientPhone"], FieldPatch::Delete);
        assert_eq!(patch["callbackTime"], FieldPatch::Delete);
        assert!(!patch.contains_key("visitWon"));
    }
}
