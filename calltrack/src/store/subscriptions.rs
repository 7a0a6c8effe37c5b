//! Snapshot fan-out shared by the store implementations

use super::{Collection, Document, Query, SnapshotStream};
use std::sync::Mutex;
use tokio::sync::mpsc;

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<Document>>,
}

/// Registry of live subscriptions.
#[derive(Default)]
pub struct SubscriptionHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query and deliver its initial snapshot.
    pub fn register(&self, query: Query, initial: Vec<Document>) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(initial);

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber { query, tx });
        tracing::debug!("Registered subscription ({} live)", subscribers.len());
        rx
    }

    /// Queries watching `collection`, pruning subscriptions whose receiver is gone.
    pub fn queries_for(&self, collection: Collection) -> Vec<Query> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.tx.is_closed());
        let mut queries: Vec<Query> = Vec::new();
        for subscriber in subscribers.iter().filter(|s| s.query.collection == collection) {
            if !queries.contains(&subscriber.query) {
                queries.push(subscriber.query.clone());
            }
        }
        queries
    }

    /// Deliver a snapshot to every subscriber registered with `query`.
    pub fn publish(&self, query: &Query, snapshot: Vec<Document>) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.iter().filter(|s| &s.query == query) {
            if subscriber.tx.send(snapshot.clone()).is_err() {
                tracing::debug!("Dropping snapshot for closed {} subscription", query.collection);
            }
        }
    }
}
