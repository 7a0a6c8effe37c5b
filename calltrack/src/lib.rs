//! calltrack library
//!
//! Record synchronization and reminder engine for shared call-tracking
//! projects. The binary runs it headless; tests drive it directly.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod services;
pub mod store;
pub mod tabular;

pub use app::{AlertResolution, Engine};
pub use error::{AppError, Result};
