//! Services module
//!
//! Engine logic that sits between the record cache and the store.

pub mod import;
pub mod mutator;
pub mod notifier;
pub mod reminders;
pub mod settings;
pub mod staleness;
pub mod stats;

pub use import::ImportReconciler;
pub use mutator::{BatchResult, OptimisticMutator};
pub use notifier::{LogNotifier, Notifier, Permission};
pub use reminders::ReminderScheduler;
pub use settings::SettingsService;
