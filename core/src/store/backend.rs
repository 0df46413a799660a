// Storage abstraction for message, node and queue persistence

use super::StoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Byte-keyed storage shared by every collection.
///
/// Collections are separated by key prefix (`msg_`, `node_`, `conv_`,
/// `queue_`), so one backend instance serves all stores.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn remove(&self, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;

    /// Remove every key under `prefix`, returning how many were removed
    fn clear_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
        let entries = self.scan_prefix(prefix)?;
        for (key, _) in &entries {
            self.remove(key)?;
        }
        self.flush()?;
        Ok(entries.len())
    }
}

/// In-memory storage for tests and sessions without a data directory
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// sled-backed storage; survives process restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key, value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .remove(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
