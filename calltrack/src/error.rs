//! Error types for the call-tracking engine
//!
//! All errors use thiserror for structured error handling.
//! These errors can be serialized for display to the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store rejected a write it may accept later (offline, timeout).
    #[error("Write failed: {0}")]
    TransientWrite(String),

    /// The store refused the write under its access rules. Retrying will not help.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    /// Indices of staged rows that are neither complete nor skipped.
    #[error("Import incomplete: {} row(s) still missing required fields", .0.len())]
    IncompleteImport(Vec<usize>),

    #[error("Import error: {0}")]
    Import(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Failures that may succeed when the caller resubmits.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientWrite(_) | AppError::Database(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AppError::PermissionDenied(_))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(AppError::TransientWrite("offline".into()).is_transient());
        assert!(!AppError::PermissionDenied("rules".into()).is_transient());
        assert!(AppError::PermissionDenied("rules".into()).is_permission_denied());
    }

    #[test]
    fn test_incomplete_import_message() {
        let err = AppError::IncompleteImport(vec![1, 4]);
        assert_eq!(
            err.to_string(),
            "Import incomplete: 2 row(s) still missing required fields"
        );
    }

    #[test]
    fn test_serializes_as_display_string() {
        let json = serde_json::to_string(&AppError::NotFound("log-1".into())).unwrap();
        assert_eq!(json, "\"Not found: log-1\"");
    }
}
