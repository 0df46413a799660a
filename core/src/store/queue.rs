// Outbound queue persistence
//
// Queue items are bincode-encoded under `queue_{id}`. Each item carries an
// insertion sequence number so FIFO order survives restarts regardless of
// how the backend orders keys.

use super::backend::StorageBackend;
use super::StoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const QUEUE_PREFIX: &str = "queue_";

/// An outbound message awaiting confirmed transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Caller-assigned id, shared with the stored message
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub channel: u8,
    /// Creation time (unix millis)
    pub timestamp: u64,
    pub retry_count: u32,
    /// Not retried before this time (unix millis)
    pub next_retry_time: u64,
    /// Set after the first failed attempt
    pub last_error: Option<String>,
    /// Insertion order
    pub seq: u64,
}

impl QueuedMessage {
    /// A fresh item, due immediately
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        channel: u8,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            channel,
            timestamp: now,
            retry_count: 0,
            next_retry_time: now,
            last_error: None,
            seq: 0,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.next_retry_time <= now
    }
}

fn queue_key(id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, id)
}

#[derive(Clone)]
pub struct QueueStore {
    backend: Arc<dyn StorageBackend>,
    // Guards sequence assignment and read-modify-write updates
    lock: Arc<Mutex<()>>,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn write(&self, item: &QueuedMessage) -> Result<(), StoreError> {
        let bytes = bincode::serialize(item)?;
        self.backend.put(queue_key(&item.id).as_bytes(), &bytes)?;
        self.backend.flush()
    }

    fn read(&self, id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        match self.backend.get(queue_key(id).as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.backend
            .scan_prefix(QUEUE_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, value)| bincode::deserialize(&value).map_err(StoreError::from))
            .collect()
    }

    /// Persist a new item at the tail of the queue.
    ///
    /// Re-inserting a known id replaces the item but keeps its position.
    pub fn insert(&self, mut item: QueuedMessage) -> Result<QueuedMessage, StoreError> {
        let _guard = self.lock.lock();
        item.seq = match self.read(&item.id)? {
            Some(existing) => existing.seq,
            None => self.scan()?.iter().map(|q| q.seq + 1).max().unwrap_or(0),
        };
        self.write(&item)?;
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        self.read(id)
    }

    /// Every item in insertion order
    pub fn get_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut items = self.scan()?;
        items.sort_by_key(|q| q.seq);
        Ok(items)
    }

    /// Mutate one item and persist the result before returning it.
    ///
    /// `Ok(None)` if the id is not queued.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Option<QueuedMessage>, StoreError>
    where
        F: FnOnce(&mut QueuedMessage),
    {
        let _guard = self.lock.lock();
        let Some(mut item) = self.read(id)? else {
            return Ok(None);
        };
        mutate(&mut item);
        self.write(&item)?;
        Ok(Some(item))
    }

    /// Apply `mutate` to every item, persisting each one
    pub fn update_all<F>(&self, mut mutate: F) -> Result<usize, StoreError>
    where
        F: FnMut(&mut QueuedMessage),
    {
        let _guard = self.lock.lock();
        let items = self.scan()?;
        for mut item in items.iter().cloned() {
            mutate(&mut item);
            self.write(&item)?;
        }
        Ok(items.len())
    }

    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        let key = queue_key(id);
        let existed = self.backend.get(key.as_bytes())?.is_some();
        self.backend.remove(key.as_bytes())?;
        self.backend.flush()?;
        Ok(existed)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock();
        self.backend.clear_prefix(QUEUE_PREFIX.as_bytes())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(QUEUE_PREFIX.as_bytes())
    }
}
