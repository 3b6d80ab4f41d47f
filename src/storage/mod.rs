//! Document storage
//!
//! The engine persists Personas, Schemas, Threads and conductor summaries as
//! JSON documents keyed by id inside named collections. Any backend that
//! implements [`DocumentStore`] can be plugged in; two ship with the crate:
//! - [`MemoryStore`]: in-process, with change notifications
//! - [`FileStore`]: one JSON file per record under a data directory

mod file;
mod memory;

pub use file::FileStore;
pub use memory::{ChangeEvent, ChangeListener, MemoryStore};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Collection names used by the engine
pub mod collections {
    pub const PERSONAS: &str = "personas";
    pub const SCHEMAS: &str = "schemas";
    pub const THREADS: &str = "threads";
    pub const CONDUCTOR_SUMMARIES: &str = "conductor_summaries";
}

/// Filter applied to records by [`DocumentStore::query`]
pub type Predicate<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Key-value document store collaborator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the record stored under `id`
    async fn save(&self, collection: &str, id: &str, record: Value) -> Result<()>;

    /// Fetch a record, failing with `Error::NotFound` when absent
    async fn get(&self, collection: &str, id: &str) -> Result<Value>;

    /// All records of a collection matching `predicate`, ordered by id
    async fn query(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>>;
}

// ─────────────────────────────────────────────────────────────────
// Typed helpers
// ─────────────────────────────────────────────────────────────────

/// Serialize and save a typed record
pub async fn save_record<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    record: &T,
) -> Result<()> {
    let value = serde_json::to_value(record)?;
    store.save(collection, id, value).await
}

/// Fetch and deserialize a typed record
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<T> {
    let value = store.get(collection, id).await?;
    Ok(serde_json::from_value(value)?)
}

/// Fetch every record of a collection, deserialized
pub async fn list_records<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<Vec<T>> {
    store
        .query(collection, &|_| true)
        .await?
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Into::into))
        .collect()
}
