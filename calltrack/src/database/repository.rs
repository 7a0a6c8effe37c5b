//! SQLite document store
//!
//! Implements [`RemoteStore`] over the `documents` table.
//! Every write runs in a transaction; batches share one. Writes are
//! serialized with their snapshot publication so subscribers never see an
//! older snapshot after a newer one.

use crate::error::{AppError, Result};
use crate::store::{
    apply_patch, Collection, Document, Fields, NewDocument, Patch, Query, RemoteStore,
    SnapshotStream, SubscriptionHub, WriteOp,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Document store persisted in SQLite
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    hub: Arc<SubscriptionHub>,
    /// Held from transaction start until the resulting snapshots are published.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hub: Arc::new(SubscriptionHub::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn select(&self, query: &Query) -> Result<Vec<Document>> {
        let rows: Vec<(String, String)> = match &query.filter {
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, data FROM documents
                    WHERE collection = ?
                    ORDER BY id
                    "#,
                )
                .bind(query.collection.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            Some(filter) => {
                sqlx::query_as(
                    r#"
                    SELECT id, data FROM documents
                    WHERE collection = ?
                      AND json_extract(data, '$.' || ?) = json_extract(?, '$')
                    ORDER BY id
                    "#,
                )
                .bind(query.collection.as_str())
                .bind(&filter.field)
                .bind(filter.value.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|(id, data)| {
                let fields: Fields = serde_json::from_str(&data)?;
                Ok(Document { id, fields })
            })
            .collect()
    }

    async fn apply(tx: &mut Transaction<'_, Sqlite>, op: WriteOp) -> Result<Option<String>> {
        match op {
            WriteOp::Put { collection, doc } => {
                let id = doc.id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                Self::upsert(tx, collection, &id, &doc.fields).await?;
                Ok(Some(id))
            }
            WriteOp::Update {
                collection,
                id,
                patch,
            } => {
                let data: String = sqlx::query_scalar(
                    "SELECT data FROM documents WHERE collection = ? AND id = ?",
                )
                .bind(collection.as_str())
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("{}/{}", collection, id)))?;

                let mut fields: Fields = serde_json::from_str(&data)?;
                apply_patch(&mut fields, &patch);
                Self::upsert(tx, collection, &id, &fields).await?;
                Ok(None)
            }
            WriteOp::Delete { collection, id } => {
                let rows = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                    .bind(collection.as_str())
                    .bind(&id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();

                if rows == 0 {
                    return Err(AppError::NotFound(format!("{}/{}", collection, id)));
                }
                Ok(None)
            }
        }
    }

    async fn upsert(
        tx: &mut Transaction<'_, Sqlite>,
        collection: Collection,
        id: &str,
        fields: &Fields,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(serde_json::to_string(fields)?)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<String>>> {
        let touched: BTreeSet<Collection> = ops.iter().map(WriteOp::collection).collect();

        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(ops.len());
        for op in ops {
            ids.push(Self::apply(&mut tx, op).await?);
        }
        tx.commit().await?;

        for collection in touched {
            self.publish(collection).await;
        }

        Ok(ids)
    }

    /// Push fresh snapshots to subscribers of `collection`.
    async fn publish(&self, collection: Collection) {
        for query in self.hub.queries_for(collection) {
            match self.select(&query).await {
                Ok(snapshot) => self.hub.publish(&query, snapshot),
                Err(e) => tracing::error!("Failed to refresh {} snapshot: {}", collection, e),
            }
        }
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream> {
        let initial = self.select(&query).await?;
        Ok(self.hub.register(query, initial))
    }

    async fn read(&self, query: Query) -> Result<Vec<Document>> {
        self.select(&query).await
    }

    async fn put(&self, collection: Collection, doc: NewDocument) -> Result<String> {
        let ids = self.commit(vec![WriteOp::Put { collection, doc }]).await?;
        let id = ids
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| AppError::Generic("put returned no id".to_string()))?;

        tracing::debug!("Stored {}/{}", collection, id);
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Patch) -> Result<()> {
        self.commit(vec![WriteOp::Update {
            collection,
            id: id.to_string(),
            patch,
        }])
        .await?;

        tracing::debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.commit(vec![WriteOp::Delete {
            collection,
            id: id.to_string(),
        }])
        .await?;

        tracing::debug!("Deleted {}/{}", collection, id);
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<String>>> {
        let count = ops.len();
        let ids = self.commit(ops).await?;
        tracing::debug!("Committed batch of {} writes", count);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{create_pool, schema::initialize_database};
    use crate::store::FieldPatch;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn create_test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        initialize_database(&pool).await.unwrap();

        SqliteStore::new(pool)
    }

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_put_and_read() {
        let store = create_test_store().await;

        let id = store
            .put(
                Collection::Projects,
                NewDocument::new(fields(json!({"name": "Lakeview"}))),
            )
            .await
            .unwrap();

        let docs = store.read(Query::all(Collection::Projects)).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);
        assert_eq!(docs[0].fields["name"], "Lakeview");
    }

    #[tokio::test]
    async fn test_put_with_id_upserts() {
        let store = create_test_store().await;

        for name in ["First", "Second"] {
            store
                .put(
                    Collection::StatOverrides,
                    NewDocument::with_id("p1_2024-05-10", fields(json!({"name": name}))),
                )
                .await
                .unwrap();
        }

        let docs = store
            .read(Query::all(Collection::StatOverrides))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fields["name"], "Second");
    }

    #[tokio::test]
    async fn test_filtered_read() {
        let store = create_test_store().await;

        for project in ["p1", "p1", "p2"] {
            store
                .put(
                    Collection::CallLogs,
                    NewDocument::new(fields(json!({"projectId": project}))),
                )
                .await
                .unwrap();
        }

        let docs = store
            .read(Query::where_eq(Collection::CallLogs, "projectId", "p1"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let store = create_test_store().await;

        let id = store
            .put(
                Collection::CallLogs,
                NewDocument::new(fields(json!({
                    "status": "Call Back Later",
                    "callbackTime": "2024-05-10T10:00:00Z"
                }))),
            )
            .await
            .unwrap();

        let patch = Patch::from([
            ("status".to_string(), FieldPatch::Set(json!("Interested"))),
            ("callbackTime".to_string(), FieldPatch::Delete),
        ]);
        store.update(Collection::CallLogs, &id, patch).await.unwrap();

        let docs = store.read(Query::all(Collection::CallLogs)).await.unwrap();
        assert_eq!(docs[0].fields["status"], "Interested");
        assert!(docs[0].fields.get("callbackTime").is_none());
    }

    #[tokio::test]
    async fn test_missing_documents_are_not_found() {
        let store = create_test_store().await;

        let update = store
            .update(Collection::CallLogs, "nope", Patch::new())
            .await;
        assert!(matches!(update, Err(AppError::NotFound(_))));

        let delete = store.delete(Collection::CallLogs, "nope").await;
        assert!(matches!(delete, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = create_test_store().await;

        let result = store
            .batch_write(vec![
                WriteOp::Put {
                    collection: Collection::CallLogs,
                    doc: NewDocument::new(fields(json!({"clientName": "Meera"}))),
                },
                WriteOp::Delete {
                    collection: Collection::CallLogs,
                    id: "missing".into(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert!(store
            .read(Query::all(Collection::CallLogs))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_subscription_receives_changes() {
        let store = create_test_store().await;
        let mut rx = store
            .subscribe(Query::where_eq(Collection::CallLogs, "projectId", "p1"))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        store
            .put(
                Collection::CallLogs,
                NewDocument::new(fields(json!({"projectId": "p1"}))),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_publish_in_order() {
        let temp = TempDir::new().unwrap();
        let pool = create_pool(&temp.path().join("calltrack.db")).await.unwrap();
        let store = SqliteStore::new(pool);

        let mut rx = store
            .subscribe(Query::all(Collection::CallLogs))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .put(
                            Collection::CallLogs,
                            NewDocument::new(fields(json!({"clientName": format!("Client {}", i)}))),
                        )
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let mut sizes = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            sizes.push(snapshot.len());
        }
        assert_eq!(sizes.len(), 8);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]), "snapshots regressed: {:?}", sizes);
        assert_eq!(sizes.last(), Some(&8));
    }
}
