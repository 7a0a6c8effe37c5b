//! In-process document store
//!
//! Keeps every collection in memory and fans snapshots out through a
//! [`SubscriptionHub`]. Availability can be switched to model an offline
//! client or a store that rejects writes under its access rules.

use super::{
    apply_patch, Collection, Document, Fields, NewDocument, Patch, Query, RemoteStore,
    SnapshotStream, SubscriptionHub, WriteOp,
};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use uuid::Uuid;

type Tables = BTreeMap<Collection, BTreeMap<String, Fields>>;

/// Whether the store currently accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Online,
    /// Writes fail with a transient error.
    Offline,
    /// Writes fail with a permission error.
    Denied,
}

/// Counters of accepted write calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub puts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub batches: usize,
    pub batched_ops: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    availability: Mutex<Availability>,
    stats: Mutex<WriteStats>,
    hub: SubscriptionHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_availability(&self, availability: Availability) {
        tracing::info!("Memory store availability set to {:?}", availability);
        *self.availability.lock().unwrap_or_else(|e| e.into_inner()) = availability;
    }

    pub fn write_stats(&self) -> WriteStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a single document regardless of subscriptions.
    pub fn get(&self, collection: Collection, id: &str) -> Option<Document> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .get(&collection)
            .and_then(|table| table.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            })
    }

    fn check_writable(&self) -> Result<()> {
        match *self.availability.lock().unwrap_or_else(|e| e.into_inner()) {
            Availability::Online => Ok(()),
            Availability::Offline => Err(AppError::TransientWrite(
                "store is offline".to_string(),
            )),
            Availability::Denied => Err(AppError::PermissionDenied(
                "write rejected by access rules".to_string(),
            )),
        }
    }

    fn select(tables: &Tables, query: &Query) -> Vec<Document> {
        tables
            .get(&query.collection)
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, fields)| query.matches(fields))
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(tables: &mut Tables, op: WriteOp) -> Result<Option<String>> {
        match op {
            WriteOp::Put { collection, doc } => {
                let id = doc.id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                tables
                    .entry(collection)
                    .or_default()
                    .insert(id.clone(), doc.fields);
                Ok(Some(id))
            }
            WriteOp::Update {
                collection,
                id,
                patch,
            } => {
                let fields = tables
                    .get_mut(&collection)
                    .and_then(|table| table.get_mut(&id))
                    .ok_or_else(|| AppError::NotFound(format!("{}/{}", collection, id)))?;
                apply_patch(fields, &patch);
                Ok(None)
            }
            WriteOp::Delete { collection, id } => {
                tables
                    .get_mut(&collection)
                    .and_then(|table| table.remove(&id))
                    .ok_or_else(|| AppError::NotFound(format!("{}/{}", collection, id)))?;
                Ok(None)
            }
        }
    }

    /// Run writes against a working copy and commit it only if all succeed.
    fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<String>>> {
        self.check_writable()?;

        let touched: BTreeSet<Collection> = ops.iter().map(WriteOp::collection).collect();
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut working = tables.clone();
        let mut ids = Vec::with_capacity(ops.len());
        for op in ops {
            ids.push(Self::apply(&mut working, op)?);
        }
        *tables = working;

        for collection in touched {
            for query in self.hub.queries_for(collection) {
                self.hub.publish(&query, Self::select(&tables, &query));
            }
        }

        Ok(ids)
    }

    fn record(&self, update: impl FnOnce(&mut WriteStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream> {
        let initial = {
            let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            Self::select(&tables, &query)
        };
        Ok(self.hub.register(query, initial))
    }

    async fn read(&self, query: Query) -> Result<Vec<Document>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::select(&tables, &query))
    }

    async fn put(&self, collection: Collection, doc: NewDocument) -> Result<String> {
        let ids = self.commit(vec![WriteOp::Put { collection, doc }])?;
        self.record(|s| s.puts += 1);
        ids.into_iter()
            .flatten()
            .next()
            .ok_or_else(|| AppError::Generic("put returned no id".to_string()))
    }

    async fn update(&self, collection: Collection, id: &str, patch: Patch) -> Result<()> {
        self.commit(vec![WriteOp::Update {
            collection,
            id: id.to_string(),
            patch,
        }])?;
        self.record(|s| s.updates += 1);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.commit(vec![WriteOp::Delete {
            collection,
            id: id.to_string(),
        }])?;
        self.record(|s| s.deletes += 1);
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<String>>> {
        let count = ops.len();
        let ids = self.commit(ops)?;
        self.record(|s| {
            s.batches += 1;
            s.batched_ops += count;
        });
        Ok(ids)
    }
}
