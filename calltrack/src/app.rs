//! Engine state and lifecycle
//!
//! The `Engine` owns the record cache, the store subscriptions and the
//! services built on them. Project snapshots and the active project's call
//! logs flow from the store into the cache; the reminder scheduler re-derives
//! its timers whenever the cache changes. All writes go through the
//! optimistic mutator.

use crate::cache::RecordCache;
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{
    CallLog, CallLogUpdate, CallStatus, CallerStats, DailyOverrides, FieldUpdate, NewCallLog,
    Project,
};
use crate::services::import::{
    CommitResult, ImportOptions, ImportReconciler, ImportRow, ImportSummary, ParseOutcome, RowEdit,
};
use crate::services::notifier::Notifier;
use crate::services::settings::{Preferences, SettingsService};
use crate::services::staleness::{self, Staleness};
use crate::services::stats::{self, CallerDay, DaySummary};
use crate::services::{OptimisticMutator, ReminderScheduler};
use crate::store::{Collection, Document, Query, RemoteStore, SnapshotStream};
use crate::tabular;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Outcome chosen by the user for an active alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertResolution {
    pub status: CallStatus,
    pub notes: Option<String>,
    /// Required when the new status is CallBackLater.
    pub callback_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tasks {
    projects: Option<JoinHandle<()>>,
    records: Option<JoinHandle<()>>,
    reminders: Option<JoinHandle<()>>,
}

/// Call-tracking engine holding all services
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn RemoteStore>,
    cache: Arc<RwLock<RecordCache>>,
    mutator: OptimisticMutator,
    reminders: ReminderScheduler,
    settings: SettingsService,
    preferences: Arc<Mutex<Preferences>>,
    clock: Arc<dyn Clock>,
    tasks: Arc<Mutex<Tasks>>,
    /// Serializes project activation.
    switching: Arc<tokio::sync::Mutex<()>>,
}

fn decode_all<T: DeserializeOwned>(docs: &[Document]) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match doc.decode() {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!("Skipping malformed document {}: {}", doc.id, e);
                None
            }
        })
        .collect()
}

impl Engine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        settings: SettingsService,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(RwLock::new(RecordCache::new()));
        let mutator = OptimisticMutator::new(Arc::clone(&store), Arc::clone(&cache), Arc::clone(&clock));
        let reminders = ReminderScheduler::new(Arc::clone(&clock), notifier);

        Self {
            store,
            cache,
            mutator,
            reminders,
            settings,
            preferences: Arc::new(Mutex::new(Preferences::default())),
            clock,
            tasks: Arc::new(Mutex::new(Tasks::default())),
            switching: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn preferences(&self) -> Preferences {
        self.preferences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Load preferences, subscribe to the store and activate a project.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting engine");

        self.reminders.request_permission().await;

        let preferences = self.settings.load().await?;
        *self.preferences.lock().unwrap_or_else(|e| e.into_inner()) = preferences.clone();

        let mut projects_rx = self.store.subscribe(Query::all(Collection::Projects)).await?;
        let initial = projects_rx.recv().await.unwrap_or_default();
        let mut projects: Vec<Project> = decode_all(&initial);
        if projects.is_empty() {
            projects.push(self.mutator.ensure_default_project().await?);
        }
        self.cache.write().await.replace_projects(projects.clone());

        let active = preferences
            .last_active_project_id
            .as_deref()
            .and_then(|id| projects.iter().find(|p| p.id == id))
            .unwrap_or(&projects[0])
            .clone();

        self.spawn_reminder_watcher().await;
        self.activate(&active, false).await?;

        let projects_task = self.spawn_project_pump(projects_rx);
        self.tasks().projects = Some(projects_task);

        tracing::info!("Engine started with project {} ({})", active.name, active.id);
        Ok(())
    }

    /// Stop background tasks and timers.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks();
        for task in [
            tasks.projects.take(),
            tasks.records.take(),
            tasks.reminders.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.reminders.shutdown();
        tracing::info!("Engine stopped");
    }

    async fn spawn_reminder_watcher(&self) {
        let mut revisions = self.cache.read().await.subscribe();
        let cache = Arc::clone(&self.cache);
        let reminders = self.reminders.clone();

        let task = tokio::spawn(async move {
            while revisions.changed().await.is_ok() {
                let logs = cache.read().await.call_logs();
                reminders.refresh(&logs);
            }
        });
        self.tasks().reminders = Some(task);
    }

    fn spawn_project_pump(&self, mut rx: SnapshotStream) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if let Err(e) = engine.on_projects(snapshot, &mut rx).await {
                    tracing::error!("Failed to apply project snapshot: {}", e);
                }
            }
            tracing::debug!("Project subscription closed");
        })
    }

    async fn on_projects(&self, mut snapshot: Vec<Document>, rx: &mut SnapshotStream) -> Result<()> {
        let fallback = {
            let mut cache = self.cache.write().await;
            // Snapshots are complete; only the newest matters.
            while let Ok(next) = rx.try_recv() {
                snapshot = next;
            }
            let projects: Vec<Project> = decode_all(&snapshot);
            cache.replace_projects(projects.clone());

            match cache.project_id() {
                _ if projects.is_empty() => None,
                Some(id) if projects.iter().any(|p| p.id == id) => None,
                _ => projects.first().cloned(),
            }
        };

        if snapshot.is_empty() {
            self.mutator.ensure_default_project().await?;
            return Ok(());
        }

        if let Some(project) = fallback {
            tracing::warn!("Active project disappeared, falling back to {}", project.id);
            self.activate(&project, false).await?;
        }
        Ok(())
    }

    /// Point the cache, subscriptions and reminders at `project`.
    async fn activate(&self, project: &Project, touch: bool) -> Result<()> {
        let _switching = self.switching.lock().await;

        if let Some(task) = self.tasks().records.take() {
            task.abort();
        }

        self.reminders.switch_project(&project.name);
        self.cache.write().await.switch_project(&project.id);

        let mut logs_rx = self
            .store
            .subscribe(Query::where_eq(Collection::CallLogs, "projectId", project.id.as_str()))
            .await?;
        let mut overrides_rx = self
            .store
            .subscribe(Query::where_eq(
                Collection::StatOverrides,
                "projectId",
                project.id.as_str(),
            ))
            .await?;

        let logs = logs_rx.recv().await.unwrap_or_default();
        let overrides = overrides_rx.recv().await.unwrap_or_default();
        {
            let mut cache = self.cache.write().await;
            cache.replace_call_logs(decode_all(&logs));
            cache.replace_overrides(decode_all(&overrides));
        }

        let task = self.spawn_record_pump(project.id.clone(), logs_rx, overrides_rx);
        self.tasks().records = Some(task);

        if let Err(e) = self.settings.set_last_active_project(&project.id).await {
            tracing::warn!("Failed to persist active project: {}", e);
        }
        self.preferences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_active_project_id = Some(project.id.clone());

        if touch {
            self.mutator.touch(&project.id);
        }

        tracing::info!("Active project is now {} ({})", project.name, project.id);
        Ok(())
    }

    fn spawn_record_pump(
        &self,
        project_id: String,
        mut logs_rx: SnapshotStream,
        mut overrides_rx: SnapshotStream,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    snapshot = logs_rx.recv() => {
                        let Some(docs) = snapshot else { break };
                        let mut cache = cache.write().await;
                        if cache.project_id() == Some(project_id.as_str()) {
                            cache.replace_call_logs(decode_all(&docs));
                        }
                    }
                    snapshot = overrides_rx.recv() => {
                        let Some(docs) = snapshot else { break };
                        let mut cache = cache.write().await;
                        if cache.project_id() == Some(project_id.as_str()) {
                            cache.replace_overrides(decode_all(&docs));
                        }
                    }
                }
            }
            tracing::debug!("Record subscription for {} closed", project_id);
        })
    }

    async fn active_project_id(&self) -> Result<String> {
        self.cache
            .read()
            .await
            .project_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Generic("Engine has no active project".to_string()))
    }

    // ===== Call logs =====

    /// Add a record to the active project. A blank caller uses the display name.
    pub async fn add_call_log(&self, mut new: NewCallLog) -> Result<CallLog> {
        if new.project_id.trim().is_empty() {
            new.project_id = self.active_project_id().await?;
        }
        if new.caller_name.trim().is_empty() {
            new.caller_name = self.preferences().display_name.unwrap_or_default();
        }
        self.mutator.add(new).await
    }

    pub async fn update_call_log(&self, id: &str, update: CallLogUpdate) -> Result<()> {
        self.mutator.update(id, update).await
    }

    pub async fn delete_call_log(&self, id: &str) -> Result<()> {
        self.mutator.delete(id).await
    }

    /// Negative counts are stored as zero.
    pub async fn set_follow_up_count(&self, id: &str, count: i64) -> Result<()> {
        let count = count.clamp(0, u32::MAX as i64) as u32;
        let update = CallLogUpdate {
            follow_up_count: Some(count),
            ..CallLogUpdate::default()
        };
        self.mutator.update(id, update).await
    }

    /// Record the outcome of a due callback and release its alert.
    pub async fn resolve_alert(&self, id: &str, resolution: AlertResolution) -> Result<()> {
        let callback_time = match (resolution.status, resolution.callback_time) {
            (CallStatus::CallBackLater, Some(at)) => FieldUpdate::Set(at),
            (CallStatus::CallBackLater, None) => {
                return Err(AppError::Validation(
                    "A new callback time is required".to_string(),
                ))
            }
            _ => FieldUpdate::Clear,
        };

        let update = CallLogUpdate {
            status: Some(resolution.status),
            timestamp: Some(self.clock.now()),
            notes: resolution
                .notes
                .map(FieldUpdate::Set)
                .unwrap_or(FieldUpdate::Keep),
            callback_time,
            ..CallLogUpdate::default()
        };

        self.mutator.update(id, update).await?;
        self.reminders.resolve(id);
        Ok(())
    }

    pub async fn call_logs(&self) -> Vec<CallLog> {
        self.cache.read().await.call_logs()
    }

    pub async fn call_log(&self, id: &str) -> Option<CallLog> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn upcoming_callbacks(&self) -> Vec<CallLog> {
        self.cache.read().await.upcoming_callbacks(self.clock.now())
    }

    pub async fn pending_follow_ups(&self) -> Vec<CallLog> {
        self.cache.read().await.pending_follow_ups()
    }

    /// Receiver that changes on every cache update.
    pub async fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.cache.read().await.subscribe()
    }

    // ===== Projects =====

    pub async fn projects(&self) -> Vec<Project> {
        self.cache.read().await.projects().to_vec()
    }

    pub async fn active_project(&self) -> Option<Project> {
        let cache = self.cache.read().await;
        cache.project_id().and_then(|id| cache.project(id)).cloned()
    }

    /// Create a project and make it active.
    pub async fn add_project(&self, name: &str) -> Result<Project> {
        let project = self.mutator.add_project(name).await?;
        self.activate(&project, true).await?;
        Ok(project)
    }

    /// Delete a project. Deleting the active one switches to another.
    pub async fn delete_project(&self, id: &str) -> Result<()> {
        self.mutator.delete_project(id).await?;

        let next = {
            let cache = self.cache.read().await;
            if cache.project_id() == Some(id) {
                cache.projects().iter().find(|p| p.id != id).cloned()
            } else {
                None
            }
        };
        if let Some(project) = next {
            self.activate(&project, true).await?;
        }
        Ok(())
    }

    pub async fn switch_project(&self, id: &str) -> Result<Project> {
        let project = self
            .cache
            .read()
            .await
            .project(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Project {}", id)))?;

        self.activate(&project, true).await?;
        Ok(project)
    }

    pub async fn staleness(&self) -> Staleness {
        let cache = self.cache.read().await;
        staleness::detect(cache.projects(), cache.project_id())
    }

    /// Switch to the most recently active project, if the current one is stale.
    pub async fn accept_suggested_project(&self) -> Result<Option<Project>> {
        match self.staleness().await.suggested {
            Some(project) => self.switch_project(&project.id).await.map(Some),
            None => Ok(None),
        }
    }

    // ===== Reminders =====

    pub fn active_alert(&self) -> Option<CallLog> {
        self.reminders.active_alert()
    }

    pub fn subscribe_alerts(&self) -> watch::Receiver<Option<CallLog>> {
        self.reminders.subscribe_alerts()
    }

    // ===== Import =====

    /// Reconciler configured for the active project and local preferences.
    pub async fn import_reconciler(&self) -> Result<ImportReconciler> {
        let preferences = self.preferences();
        let options = ImportOptions {
            project_id: self.active_project_id().await?,
            require_caller_name: preferences.import.require_caller_name,
            default_caller_name: preferences.display_name,
        };
        Ok(ImportReconciler::new(options))
    }

    pub async fn parse_import(&self, rows: &[ImportRow]) -> Result<ParseOutcome> {
        self.import_reconciler()
            .await?
            .parse(rows, self.clock.now())
    }

    /// Read and parse an import file. An unreadable file is a single import failure.
    pub async fn parse_import_file(&self, path: &Path) -> Result<ParseOutcome> {
        let path = path.to_path_buf();
        let rows = tokio::task::spawn_blocking(move || tabular::read_rows(&path))
            .await
            .map_err(|e| AppError::Import(format!("Reader task failed: {}", e)))??;
        self.parse_import(&rows).await
    }

    /// Write ready and reviewed rows in one batch.
    pub async fn commit_import(
        &self,
        ready: Vec<NewCallLog>,
        reviewed: CommitResult,
    ) -> Result<ImportSummary> {
        let mut records = ready;
        records.extend(reviewed.records);

        let batch = self.mutator.batch_add(records).await?;
        let summary = ImportSummary::from_batch(&batch, &reviewed.skipped);
        tracing::info!(
            "Import finished: {} imported, {} errors",
            summary.success_count,
            summary.error_count
        );
        Ok(summary)
    }

    /// Parse, apply review edits and commit in one step.
    pub async fn import_rows(&self, rows: &[ImportRow], edits: Vec<RowEdit>) -> Result<ImportSummary> {
        let reconciler = self.import_reconciler().await?;
        let outcome = reconciler.parse(rows, self.clock.now())?;
        let reviewed = reconciler.review_commit(outcome.staged, edits)?;
        self.commit_import(outcome.ready, reviewed).await
    }

    // ===== Statistics =====

    pub async fn daily_stats(&self, date: NaiveDate) -> CallerStats {
        stats::daily_summary(&self.cache.read().await.call_logs(), date)
    }

    pub async fn caller_stats(&self, date: NaiveDate) -> Vec<CallerDay> {
        let cache = self.cache.read().await;
        stats::caller_days(&cache.call_logs(), date, cache.overrides_for(date))
    }

    /// Past days of the active project, newest first.
    pub async fn summary_history(&self) -> Vec<DaySummary> {
        let today = self.clock.now().date_naive();
        stats::history(&self.cache.read().await.call_logs(), today)
    }

    /// Set a caller's stats for `date`. Values equal to the computed ones are not stored.
    pub async fn set_stat_override(
        &self,
        date: NaiveDate,
        caller: &str,
        desired: CallerStats,
    ) -> Result<()> {
        let caller = caller.trim();
        if caller.is_empty() {
            return Err(AppError::Validation("Caller name is required".to_string()));
        }

        let project_id = self.active_project_id().await?;
        let day = {
            let cache = self.cache.read().await;
            let computed = stats::caller_breakdown(&cache.call_logs(), date)
                .remove(caller)
                .unwrap_or_default();

            let mut day = cache.overrides_for(date).cloned().unwrap_or(DailyOverrides {
                id: DailyOverrides::doc_id(&project_id, date),
                project_id: project_id.clone(),
                date,
                callers: Default::default(),
            });
            stats::apply_override(&mut day, caller, stats::reconcile_override(computed, desired));
            day
        };

        self.mutator.write_stat_overrides(day).await
    }

    // ===== Preferences =====

    pub async fn set_display_name(&self, name: Option<String>) -> Result<()> {
        self.settings.set_display_name(name).await?;
        let preferences = self.settings.load().await?;
        *self.preferences.lock().unwrap_or_else(|e| e.into_inner()) = preferences;
        Ok(())
    }

    /// Whether the store has refused a write under its access rules.
    pub fn access_blocked(&self) -> bool {
        *self.mutator.access_blocked().borrow()
    }

    pub fn subscribe_access_blocked(&self) -> watch::Receiver<bool> {
        self.mutator.access_blocked()
    }
}
