//! Database module
//!
//! SQLite persistence for the document store: the schema lives in
//! [`schema`], and [`SqliteStore`] serves collections from the single
//! `documents` table.

pub mod repository;
pub mod schema;

pub use repository::SqliteStore;
pub use schema::initialize_database;

use crate::config::{DB_BUSY_TIMEOUT_SECS, DB_MAX_CONNECTIONS};
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Open the store database at `db_path`, creating and migrating it as needed.
///
/// The schema is brought up to date over one connection, which is closed
/// before the shared pool opens.
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(DB_BUSY_TIMEOUT_SECS));

    let setup = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options.clone())
        .await?;
    initialize_database(&setup).await?;
    setup.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    tracing::info!("Store database ready at {:?}", db_path);
    Ok(pool)
}
