//! Store schema
//!
//! Documents of every collection live in one table as JSON text, keyed by
//! collection and id. Schema changes are numbered steps recorded in
//! `schema_versions`; each pending step runs in its own transaction.

use crate::error::Result;
use sqlx::sqlite::SqlitePool;

struct SchemaStep {
    version: i64,
    description: &'static str,
    statements: &'static [&'static str],
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        description: "documents table",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents (collection)",
        ],
    },
    SchemaStep {
        version: 2,
        description: "call log project index",
        statements: &[r#"
            CREATE INDEX IF NOT EXISTS idx_documents_project
                ON documents (collection, json_extract(data, '$.projectId'))
            "#],
    },
];

/// Bring the schema up to the latest version.
pub async fn initialize_database(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current = schema_version(pool).await?;
    let pending: Vec<&SchemaStep> = SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > current)
        .collect();

    if pending.is_empty() {
        tracing::debug!("Store schema is current at version {}", current);
        return Ok(());
    }

    for step in pending {
        let mut tx = pool.begin().await?;
        for statement in step.statements {
            sqlx::query(*statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_versions (version, description) VALUES (?, ?)")
            .bind(step.version)
            .bind(step.description)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("Store schema at version {} ({})", step.version, step.description);
    }
    Ok(())
}

/// Highest applied schema version, 0 for a fresh database.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_versions")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_database() {
        let pool = memory_pool().await;

        initialize_database(&pool).await.unwrap();

        assert_eq!(schema_version(&pool).await.unwrap(), 2);

        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(documents, 0);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let pool = memory_pool().await;

        initialize_database(&pool).await.unwrap();
        initialize_database(&pool).await.unwrap();

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_versions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(applied, SCHEMA_STEPS.len() as i64);
    }

    #[tokio::test]
    async fn test_resumes_from_recorded_version() {
        let pool = memory_pool().await;
        initialize_database(&pool).await.unwrap();

        sqlx::query("DROP INDEX idx_documents_project")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM schema_versions WHERE version = 2")
            .execute(&pool)
            .await
            .unwrap();

        initialize_database(&pool).await.unwrap();

        let indexes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_documents_project'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(indexes, 1);
        assert_eq!(schema_version(&pool).await.unwrap(), 2);
    }
}
