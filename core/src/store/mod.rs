// Store module: message, node and delivery-queue persistence

pub mod backend;
pub mod messages;
pub mod nodes;
pub mod queue;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use messages::{
    default_node_name, Conversation, MessageKind, MessageStatus, MessageStore, StoredMessage,
};
pub use nodes::{NodeSort, NodeStore, NodeType, SignalQuality, StoredNode};
pub use queue::{QueueStore, QueuedMessage};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Record counts per collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub message_count: usize,
    pub node_count: usize,
    pub conversation_count: usize,
    pub queue_count: usize,
}

/// All collections over one shared backend
#[derive(Clone)]
pub struct Stores {
    pub messages: MessageStore,
    pub nodes: NodeStore,
    pub queue: QueueStore,
}

impl Stores {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            messages: MessageStore::new(Arc::clone(&backend)),
            nodes: NodeStore::new(Arc::clone(&backend)),
            queue: QueueStore::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// sled database at `path`, created if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledStorage::open(path)?)))
    }

    pub fn info(&self) -> Result<StorageInfo, StoreError> {
        Ok(StorageInfo {
            message_count: self.messages.count()?,
            node_count: self.nodes.count()?,
            conversation_count: self.messages.conversation_count()?,
            queue_count: self.queue.count()?,
        })
    }

    /// Wipe every collection
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.messages.clear()?;
        self.nodes.clear()?;
        self.queue.clear()?;
        Ok(())
    }
}
