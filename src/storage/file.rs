//! File-backed document store
//!
//! Layout: `<root>/<collection>/<id>.json`. Writes go to a temporary file
//! first and are renamed into place so readers never see a torn record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

use super::{DocumentStore, Predicate};

/// Document store that keeps one JSON file per record
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        check_key("collection", collection)?;
        check_key("id", id)?;
        Ok(self.root.join(collection).join(format!("{}.json", id)))
    }
}

/// Keys become path components, so separators and dot segments are refused.
fn check_key(kind: &str, key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains("..")
    {
        return Err(Error::storage(format!("invalid {} key '{}'", kind, key)));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn save(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        let path = self.record_path(collection, id)?;
        let dir = self.root.join(collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("cannot create {}: {}", dir.display(), e)))?;

        let body = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::storage(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage(format!("cannot replace {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Record written");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        let path = self.record_path(collection, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(collection, id)),
            Err(e) => Err(Error::storage(format!("cannot read {}: {}", path.display(), e))),
        }
    }

    async fn query(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>> {
        check_key("collection", collection)?;
        let dir = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("cannot list {}: {}", dir.display(), e))),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage(format!("cannot list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;
            let value: Value = serde_json::from_slice(&bytes)?;
            if predicate(&value) {
                records.push(value);
            }
        }
        Ok(records)
    }
}
