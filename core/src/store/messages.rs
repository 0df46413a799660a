// Message and conversation persistence
//
// Messages are keyed `msg_{id}`, conversation summaries `conv_{nodeHash}`.
// Values are JSON so stored records stay readable by the app layer.

use super::backend::StorageBackend;
use super::StoreError;
use crate::protocol::BROADCAST_ADDRESS;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const MESSAGE_PREFIX: &str = "msg_";
const CONVERSATION_PREFIX: &str = "conv_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Statuses only move forward; `Failed` is reachable from `Pending` alone
    /// and is terminal.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Pending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Position,
    Telemetry,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Node hash or `"broadcast"`
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
    pub content: String,
    pub timestamp: u64,
    pub status: MessageStatus,
    pub channel: u8,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub is_outgoing: bool,
}

impl StoredMessage {
    /// A text message this node is about to send
    pub fn outgoing_text(
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        channel: u8,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            sender_name: None,
            recipient: recipient.into(),
            recipient_name: None,
            content: content.into(),
            timestamp,
            status: MessageStatus::Pending,
            channel,
            kind: MessageKind::Text,
            is_outgoing: true,
        }
    }

    /// The other party: recipient for outgoing, sender for incoming
    pub fn peer(&self) -> &str {
        if self.is_outgoing {
            &self.recipient
        } else {
            &self.sender
        }
    }

    fn peer_name(&self) -> Option<&str> {
        if self.is_outgoing {
            self.recipient_name.as_deref()
        } else {
            self.sender_name.as_deref()
        }
    }

    fn involves(&self, node_hash: &str) -> bool {
        self.sender == node_hash || self.recipient == node_hash
    }
}

/// Per-peer summary shown in the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub node_hash: String,
    pub node_name: String,
    pub last_message: StoredMessage,
    pub unread_count: u32,
    pub last_updated: u64,
}

/// Short display name used until a node announces one
pub fn default_node_name(node_hash: &str) -> String {
    node_hash.chars().take(8).collect()
}

fn message_key(id: &str) -> String {
    format!("{}{}", MESSAGE_PREFIX, id)
}

fn conversation_key(node_hash: &str) -> String {
    format!("{}{}", CONVERSATION_PREFIX, node_hash)
}

#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn StorageBackend>,
    // Serializes read-modify-write of messages and their conversation
    write_lock: Arc<Mutex<()>>,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.put(key.as_bytes(), &bytes)
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.backend
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    /// Insert or replace a message and refresh its conversation
    pub fn save(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let is_new = self
            .backend
            .get(message_key(&message.id).as_bytes())?
            .is_none();
        self.write(&message_key(&message.id), message)?;
        self.update_conversation(message, is_new)?;
        self.backend.flush()?;
        debug!("Message saved: {}", message.id);
        Ok(())
    }

    /// Save `message` only if its id is not stored yet.
    ///
    /// Returns `Ok(false)` and leaves the existing record (and its status)
    /// untouched for a known id.
    pub fn save_if_absent(&self, message: &StoredMessage) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        if self
            .backend
            .get(message_key(&message.id).as_bytes())?
            .is_some()
        {
            return Ok(false);
        }
        self.write(&message_key(&message.id), message)?;
        self.update_conversation(message, true)?;
        self.backend.flush()?;
        debug!("Message saved: {}", message.id);
        Ok(true)
    }

    fn update_conversation(&self, message: &StoredMessage, is_new: bool) -> Result<(), StoreError> {
        let node_hash = message.peer();
        if node_hash == BROADCAST_ADDRESS {
            return Ok(());
        }

        let counts_as_unread =
            is_new && !message.is_outgoing && message.status != MessageStatus::Read;
        let key = conversation_key(node_hash);

        let conversation = match self.read::<Conversation>(&key)? {
            Some(mut existing) => {
                // Older messages arriving late do not replace the preview
                if existing.last_message.id == message.id
                    || message.timestamp >= existing.last_updated
                {
                    existing.last_message = message.clone();
                    existing.last_updated = message.timestamp;
                }
                if counts_as_unread {
                    existing.unread_count += 1;
                }
                existing
            }
            None => Conversation {
                node_hash: node_hash.to_string(),
                node_name: message
                    .peer_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| default_node_name(node_hash)),
                last_message: message.clone(),
                unread_count: u32::from(counts_as_unread),
                last_updated: message.timestamp,
            },
        };
        self.write(&key, &conversation)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        self.read(&message_key(id))
    }

    /// All messages, newest first
    pub fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages: Vec<StoredMessage> = self.scan(MESSAGE_PREFIX)?;
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(messages)
    }

    /// Messages sent to or received from `node_hash`, newest first
    pub fn messages_for_node(&self, node_hash: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|m| m.involves(node_hash))
            .collect())
    }

    /// Apply a status change if it moves the message forward.
    ///
    /// Returns `Ok(false)` for unknown ids and for transitions that would
    /// reverse the status.
    pub fn update_status(&self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(mut message) = self.get(id)? else {
            return Ok(false);
        };
        if !message.status.can_transition_to(status) {
            debug!(
                "Ignoring status change {:?} -> {:?} for {}",
                message.status, status, id
            );
            return Ok(false);
        }

        message.status = status;
        self.write(&message_key(id), &message)?;

        // Keep the conversation preview in step
        let key = conversation_key(message.peer());
        if let Some(mut conversation) = self.read::<Conversation>(&key)? {
            if conversation.last_message.id == message.id {
                conversation.last_message = message.clone();
                self.write(&key, &conversation)?;
            }
        }

        self.backend.flush()?;
        debug!("Message status updated: {} {:?}", id, status);
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.backend.remove(message_key(id).as_bytes())?;
        self.backend.flush()
    }

    /// Drop every message and conversation
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.backend.clear_prefix(MESSAGE_PREFIX.as_bytes())?;
        self.backend.clear_prefix(CONVERSATION_PREFIX.as_bytes())?;
        Ok(())
    }

    /// Conversations, most recently updated first
    pub fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self.scan(CONVERSATION_PREFIX)?;
        conversations.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(conversations)
    }

    pub fn conversation(&self, node_hash: &str) -> Result<Option<Conversation>, StoreError> {
        self.read(&conversation_key(node_hash))
    }

    /// Zero the unread count and mark that peer's incoming messages read.
    ///
    /// No-op for peers without a conversation.
    pub fn mark_conversation_read(&self, node_hash: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let key = conversation_key(node_hash);
        let Some(mut conversation) = self.read::<Conversation>(&key)? else {
            return Ok(());
        };

        for mut message in self.scan::<StoredMessage>(MESSAGE_PREFIX)? {
            if message.sender == node_hash
                && message.status.can_transition_to(MessageStatus::Read)
            {
                message.status = MessageStatus::Read;
                self.write(&message_key(&message.id), &message)?;
                if conversation.last_message.id == message.id {
                    conversation.last_message = message;
                }
            }
        }

        conversation.unread_count = 0;
        self.write(&key, &conversation)?;
        self.backend.flush()?;
        debug!("Conversation marked as read: {}", node_hash);
        Ok(())
    }

    /// Remove the summary and every message to or from the peer
    pub fn delete_conversation(&self, node_hash: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.backend
            .remove(conversation_key(node_hash).as_bytes())?;
        for message in self.scan::<StoredMessage>(MESSAGE_PREFIX)? {
            if message.involves(node_hash) {
                self.backend.remove(message_key(&message.id).as_bytes())?;
            }
        }
        self.backend.flush()?;
        debug!("Conversation deleted: {}", node_hash);
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(MESSAGE_PREFIX.as_bytes())
    }

    pub fn conversation_count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(CONVERSATION_PREFIX.as_bytes())
    }
}
