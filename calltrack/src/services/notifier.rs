//! Platform notifications
//!
//! The reminder scheduler raises notifications through [`Notifier`].
//! The daemon ships [`LogNotifier`], which writes them to the log.

use async_trait::async_trait;

/// Outcome of asking the platform to show notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    Granted,
    Denied,
    #[default]
    Unknown,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask once for permission to show notifications.
    async fn request_permission(&self) -> Permission;

    fn show(&self, title: &str, body: &str);
}

/// Notifier that records notifications as log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    fn show(&self, title: &str, body: &str) {
        tracing::info!(target: "calltrack::notification", "{}: {}", title, body);
    }
}
