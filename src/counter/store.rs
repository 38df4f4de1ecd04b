//! Durable per-key field storage.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{KeygateError, Result};
use crate::partition::PartitionMap;
use crate::ratelimit::PartitionKey;

/// Trait for the key-value store backing keyed counters.
///
/// Implementations must be strongly consistent per key. Failures are
/// returned to the caller as-is; nothing here retries.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read `field` of `key`, or `None` if it was never written.
    async fn get(&self, key: &PartitionKey, field: &str) -> Result<Option<i64>>;

    /// Write `field` of `key`. Returns once the write is durable.
    async fn put(&self, key: &PartitionKey, field: &str, value: i64) -> Result<()>;

    /// Release per-key bookkeeping idle for at least `max_idle`.
    fn evict_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}

/// In-process store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<(PartitionKey, String), i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &PartitionKey, field: &str) -> Result<Option<i64>> {
        Ok(self
            .values
            .get(&(key.clone(), field.to_string()))
            .map(|v| *v))
    }

    async fn put(&self, key: &PartitionKey, field: &str, value: i64) -> Result<()> {
        self.values.insert((key.clone(), field.to_string()), value);
        Ok(())
    }
}

type Fields = HashMap<String, i64>;

/// Store persisted as one JSON file per key under a directory.
///
/// Each key's file is rewritten through a temporary file and renamed into
/// place, so a crash leaves either the old or the new contents. Access is
/// serialized per key only; I/O for one key never waits on another.
pub struct FileStore {
    dir: PathBuf,
    locks: PartitionMap<()>,
}

impl FileStore {
    /// Open the store rooted at `dir`, creating the directory if missing.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            KeygateError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;

        info!(dir = %dir.display(), "Opened file store");
        Ok(Self {
            dir,
            locks: PartitionMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `key`. Keys are hex encoded so any string maps to a
    /// distinct, path-safe name.
    fn key_path(&self, key: &PartitionKey) -> PathBuf {
        let mut name = String::with_capacity(key.as_str().len() * 2 + 7);
        name.push_str("k-");
        for byte in key.as_str().bytes() {
            name.push_str(&format!("{:02x}", byte));
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    async fn load(&self, path: &Path) -> Result<Fields> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Fields::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Fields::new()),
            Err(e) => Err(KeygateError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn persist(&self, path: &Path, fields: &Fields) -> Result<()> {
        let bytes = serde_json::to_vec(fields)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            KeygateError::Storage(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            KeygateError::Storage(format!("failed to replace {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &PartitionKey, field: &str) -> Result<Option<i64>> {
        let _guard = self.locks.lock(key).await;
        let fields = self.load(&self.key_path(key)).await?;
        Ok(fields.get(field).copied())
    }

    async fn put(&self, key: &PartitionKey, field: &str, value: i64) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        let path = self.key_path(key);
        let mut fields = self.load(&path).await?;
        fields.insert(field.to_string(), value);

        if let Err(e) = self.persist(&path, &fields).await {
            error!(key = %key, field, error = %e, "File store write failed");
            return Err(e);
        }

        debug!(key = %key, field, value, "Persisted value");
        Ok(())
    }

    fn evict_idle(&self, max_idle: Duration) -> usize {
        self.locks.evict_idle(max_idle)
    }
}

/// Which store backs the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
}

/// Open the configured store.
pub async fn open_store(
    backend: StorageBackend,
    path: Option<&Path>,
) -> Result<Arc<dyn KeyValueStore>> {
    match backend {
        StorageBackend::Memory => {
            info!("Using in-memory store; counters will not survive restarts");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::File => {
            let path = path.ok_or_else(|| {
                KeygateError::Config("file storage requires storage.path".into())
            })?;
            Ok(Arc::new(FileStore::open(path).await?))
        }
    }
}
