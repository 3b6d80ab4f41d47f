//! In-memory document store
//!
//! Used by tests and by embedders that keep state in-process. Callers can
//! register change listeners instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

use super::{DocumentStore, Predicate};

/// Notification emitted after a record is saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
}

/// Callback invoked on every successful save
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Document store backed by in-process maps
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    listeners: RwLock<Vec<ChangeListener>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change listener
    pub fn subscribe(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }

    /// Make every subsequent save fail with a storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of records in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!(
                "write to {}/{} rejected",
                collection, id
            )));
        }

        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        trace!(collection, id, "Record saved");

        let event = ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        // Listeners run outside the map lock so they may read the store.
        let listeners: Vec<ChangeListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or_else(|| Error::not_found(collection, id))
    }

    async fn query(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.values().filter(|v| predicate(v)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let store = MemoryStore::new();
        store.save("schemas", "s1", json!({"name": "a"})).await.unwrap();
        let v = store.get("schemas", "s1").await.unwrap();
        assert_eq!(v["name"], "a");
        assert_eq!(store.count("schemas"), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("schemas", "nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_filters_in_id_order() {
        let store = MemoryStore::new();
        store.save("c", "b", json!({"n": 2})).await.unwrap();
        store.save("c", "a", json!({"n": 1})).await.unwrap();
        store.save("c", "z", json!({"n": 30})).await.unwrap();

        let small = store.query("c", &|v| v["n"].as_i64() < Some(10)).await.unwrap();
        assert_eq!(small, vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(store.query("other", &|_| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listeners_notified() {
        let store = MemoryStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        store.subscribe(Arc::new(move |event: &ChangeEvent| {
            assert_eq!(event.collection, "threads");
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        store.save("threads", "t1", json!({})).await.unwrap();
        store.save("threads", "t1", json!({"x": 1})).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.save("c", "a", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.count("c"), 0);
    }
}
