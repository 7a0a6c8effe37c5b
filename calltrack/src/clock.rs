//! Wall-clock sources
//!
//! Reminder timers sleep on tokio time while due checks compare against
//! wall-clock timestamps. `InstantClock` derives wall time from tokio's
//! monotonic clock so that paused test runtimes move both together.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored at construction and advanced by `tokio::time::Instant`.
#[derive(Debug, Clone)]
pub struct InstantClock {
    base_wall: DateTime<Utc>,
    base_instant: Instant,
}

impl InstantClock {
    pub fn new(base_wall: DateTime<Utc>) -> Self {
        Self {
            base_wall,
            base_instant: Instant::now(),
        }
    }

    pub fn shared(base_wall: DateTime<Utc>) -> Arc<dyn Clock> {
        Arc::new(Self::new(base_wall))
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.base_instant);
        self.base_wall + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}
