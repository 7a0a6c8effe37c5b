//! Reminders service
//!
//! Arms one timer per pending callback and owns the single active-alert
//! slot. Timers are re-derived from scratch on every refresh. A callback seen
//! in the future dispatches the platform notification once when it becomes
//! due; a record first seen already overdue is surfaced without one.

use crate::clock::Clock;
use crate::config::REMINDER_NOTIFICATION_TITLE;
use crate::models::CallLog;
use crate::services::notifier::{Notifier, Permission};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Default)]
struct State {
    /// Records with a pending callback, by id.
    tracked: HashMap<String, CallLog>,
    timers: HashMap<String, AbortHandle>,
    active: Option<CallLog>,
    /// Callbacks whose notification has already been dispatched.
    notified: HashSet<(String, DateTime<Utc>)>,
    /// Callbacks first seen in the future. They notify when they become due,
    /// whether their timer fires or a refresh finds them due first.
    armed: HashSet<(String, DateTime<Utc>)>,
    /// Resolved records kept out of the slot until their callback changes.
    suppressed: HashMap<String, DateTime<Utc>>,
    permission: Permission,
    project_name: String,
    /// Bumped whenever the timer set is rebuilt; stale timers check it.
    generation: u64,
}

impl State {
    fn abort_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Earliest due record that may take the slot.
    fn next_due(&self, now: DateTime<Utc>) -> Option<CallLog> {
        self.tracked
            .values()
            .filter_map(|log| log.pending_callback().map(|at| (at, log)))
            .filter(|(at, log)| *at <= now && self.suppressed.get(&log.id) != Some(at))
            .min_by(|(a, x), (b, y)| a.cmp(b).then_with(|| x.id.cmp(&y.id)))
            .map(|(_, log)| log.clone())
    }
}

/// Reminder scheduler with a single active-alert slot
#[derive(Clone)]
pub struct ReminderScheduler {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    alert: Arc<watch::Sender<Option<CallLog>>>,
}

impl ReminderScheduler {
    pub fn new(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        let (alert, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            notifier,
            alert: Arc::new(alert),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the platform for notification permission. Called once at startup.
    pub async fn request_permission(&self) -> Permission {
        let permission = self.notifier.request_permission().await;
        if permission != Permission::Granted {
            tracing::warn!("Notifications unavailable ({:?}), alerts stay in-app", permission);
        }
        self.lock().permission = permission;
        permission
    }

    pub fn active_alert(&self) -> Option<CallLog> {
        self.alert.borrow().clone()
    }

    /// Receiver that changes whenever the slot is taken or released.
    pub fn subscribe_alerts(&self) -> watch::Receiver<Option<CallLog>> {
        self.alert.subscribe()
    }

    pub fn armed_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Re-derive every timer from the current record set and rescan for due records.
    pub fn refresh(&self, logs: &[CallLog]) {
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = &mut *guard;

        state.generation += 1;
        state.abort_timers();

        state.tracked = logs
            .iter()
            .filter(|log| log.pending_callback().is_some())
            .map(|log| (log.id.clone(), log.clone()))
            .collect();

        let tracked = &state.tracked;
        let still_pending = |id: &String, at: &DateTime<Utc>| {
            tracked.get(id).and_then(CallLog::pending_callback) == Some(*at)
        };
        let suppressed = std::mem::take(&mut state.suppressed);
        state.suppressed = suppressed
            .into_iter()
            .filter(|(id, at)| still_pending(id, at))
            .collect();
        let notified = std::mem::take(&mut state.notified);
        state.notified = notified
            .into_iter()
            .filter(|(id, at)| still_pending(id, at))
            .collect();
        let armed = std::mem::take(&mut state.armed);
        state.armed = armed
            .into_iter()
            .filter(|(id, at)| still_pending(id, at))
            .collect();

        let reached: Vec<(CallLog, DateTime<Utc>)> = state
            .tracked
            .values()
            .filter_map(|log| log.pending_callback().map(|at| (log, at)))
            .filter(|(log, at)| *at <= now && state.armed.contains(&(log.id.clone(), *at)))
            .map(|(log, at)| (log.clone(), at))
            .collect();
        for (log, at) in reached {
            tracing::info!("Callback for {} became due before its timer fired", log.id);
            self.dispatch(state, &log, at);
        }

        if let Some(active) = state.active.clone() {
            match state.tracked.get(&active.id).cloned() {
                Some(current) if current.pending_callback() == active.pending_callback() => {
                    if current != active {
                        state.active = Some(current);
                        self.alert.send_replace(state.active.clone());
                    }
                }
                _ => {
                    tracing::info!("Active alert {} no longer pending, releasing", active.id);
                    self.release(state);
                }
            }
        }

        self.promote(state, now);

        let generation = state.generation;
        let future: Vec<(String, DateTime<Utc>)> = state
            .tracked
            .values()
            .filter_map(|log| log.pending_callback().map(|at| (log.id.clone(), at)))
            .filter(|(_, at)| *at > now)
            .collect();

        for (id, at) in future {
            state.armed.insert((id.clone(), at));
            let delay = (at - now).to_std().unwrap_or_default();
            let scheduler = self.clone();
            let timer_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                scheduler.on_timer(&timer_id, at, generation);
            });
            state.timers.insert(id, handle.abort_handle());
        }

        tracing::debug!(
            "Reminders refreshed: {} pending, {} timers armed",
            state.tracked.len(),
            state.timers.len()
        );
    }

    fn on_timer(&self, id: &str, at: DateTime<Utc>, generation: u64) {
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.generation != generation {
            return;
        }
        state.timers.remove(id);

        let Some(log) = state.tracked.get(id).cloned() else {
            return;
        };
        if log.pending_callback() != Some(at) {
            return;
        }

        tracing::info!("Callback due for {} ({})", log.client_name, log.id);
        self.dispatch(state, &log, at);
        self.promote(state, now);
    }

    /// Show the notification for a callback, at most once per (id, callbackTime).
    fn dispatch(&self, state: &mut State, log: &CallLog, at: DateTime<Utc>) {
        if !state.notified.insert((log.id.clone(), at)) {
            return;
        }
        if state.permission == Permission::Granted {
            let body = format!(
                "Time to call {} in project {}!",
                log.client_name, state.project_name
            );
            self.notifier.show(REMINDER_NOTIFICATION_TITLE, &body);
        }
    }

    /// Fill an empty slot with the earliest due record.
    fn promote(&self, state: &mut State, now: DateTime<Utc>) {
        if state.active.is_some() {
            return;
        }
        if let Some(next) = state.next_due(now) {
            tracing::info!("Alert active for {} ({})", next.client_name, next.id);
            state.active = Some(next);
            self.alert.send_replace(state.active.clone());
        }
    }

    fn release(&self, state: &mut State) {
        if state.active.take().is_some() {
            self.alert.send_replace(None);
        }
    }

    /// Release the slot after the user acted on the alert and surface the next due record.
    pub fn resolve(&self, id: &str) {
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(at) = state.tracked.get(id).and_then(CallLog::pending_callback) {
            state.suppressed.insert(id.to_string(), at);
        }
        if state.active.as_ref().map(|log| log.id.as_str()) == Some(id) {
            tracing::info!("Alert {} resolved", id);
            self.release(state);
        }

        self.promote(state, now);
    }

    /// Forget every timer and alert of the previous project.
    pub fn switch_project(&self, project_name: &str) {
        let mut state = self.lock();
        state.generation += 1;
        state.abort_timers();
        state.tracked.clear();
        state.suppressed.clear();
        state.notified.clear();
        state.armed.clear();
        state.project_name = project_name.to_string();
        self.release(&mut state);
        tracing::debug!("Reminders cleared for project switch to {}", project_name);
    }

    /// Abort all armed timers.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.abort_timers();
    }
}
