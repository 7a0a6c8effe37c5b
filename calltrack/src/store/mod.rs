//! Remote document store
//!
//! The engine talks to its backing store only through [`RemoteStore`]:
//! subscriptions that deliver full snapshots, and single or batched writes.
//! Two implementations ship with the crate:
//! - [`MemoryStore`] for in-process use and tests
//! - [`crate::database::SqliteStore`] for a durable local store

pub mod memory;
pub mod subscriptions;

pub use memory::{Availability, MemoryStore, WriteStats};
pub use subscriptions::SubscriptionHub;

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

/// Stored fields of a document, without its id.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Projects,
    CallLogs,
    StatOverrides,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::CallLogs => "callLogs",
            Collection::StatOverrides => "statOverrides",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Decode into a model, injecting the id as the `id` field.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Document to be written. A given id upserts; `None` lets the store assign one.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub id: Option<String>,
    pub fields: Fields,
}

impl NewDocument {
    pub fn new(fields: Fields) -> Self {
        Self { id: None, fields }
    }

    pub fn with_id(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: Some(id.into()),
            fields,
        }
    }
}

/// Serialize a model into document fields, dropping its `id`.
pub fn to_fields<T: Serialize>(model: &T) -> Result<Fields> {
    match serde_json::to_value(model)? {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        other => Err(AppError::Generic(format!(
            "Expected an object document, got {}",
            other
        ))),
    }
}

/// Equality filter on a single top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filter: Option<FieldFilter>,
}

impl Query {
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            filter: None,
        }
    }

    pub fn where_eq(collection: Collection, field: &str, value: impl Into<Value>) -> Self {
        Self {
            collection,
            filter: Some(FieldFilter {
                field: field.to_string(),
                value: value.into(),
            }),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => fields.get(&filter.field) == Some(&filter.value),
        }
    }
}

/// Change to a single field inside an update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    Set(Value),
    Delete,
}

pub type Patch = BTreeMap<String, FieldPatch>;

/// Apply a patch to stored fields in place.
pub fn apply_patch(fields: &mut Fields, patch: &Patch) {
    for (key, change) in patch {
        match change {
            FieldPatch::Set(value) => {
                fields.insert(key.clone(), value.clone());
            }
            FieldPatch::Delete => {
                fields.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        collection: Collection,
        doc: NewDocument,
    },
    Update {
        collection: Collection,
        id: String,
        patch: Patch,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Put { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => *collection,
        }
    }
}

/// Full result sets, one per change, in delivery order.
pub type SnapshotStream = mpsc::UnboundedReceiver<Vec<Document>>;

/// Document store collaborator.
///
/// Every successful write delivers a fresh snapshot to each live
/// subscription on the touched collections before returning.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to a query. The current result set is delivered immediately.
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream>;

    async fn read(&self, query: Query) -> Result<Vec<Document>>;

    /// Write a document, returning its id.
    async fn put(&self, collection: Collection, doc: NewDocument) -> Result<String>;

    /// Patch an existing document. Fails with `NotFound` if it does not exist.
    async fn update(&self, collection: Collection, id: &str, patch: Patch) -> Result<()>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    /// Apply all operations or none. Returns the id of each `Put`, `None` otherwise.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<String>>>;
}
