// Inbox: persist inbound text messages

use super::PacketSubscriber;
use crate::protocol::Packet;
use crate::store::{MessageKind, MessageStatus, MessageStore, StoreError, StoredMessage};
use tracing::{debug, error};

pub struct InboxRecorder {
    messages: MessageStore,
    local_node_id: String,
}

impl InboxRecorder {
    pub fn new(messages: MessageStore, local_node_id: impl Into<String>) -> Self {
        Self {
            messages,
            local_node_id: local_node_id.into(),
        }
    }

    /// Id under which an inbound packet is stored
    pub fn message_id(packet: &Packet) -> String {
        format!("{}-{}", packet.from, packet.id)
    }

    /// Store `packet` if it is a text message from another node.
    ///
    /// Returns the stored record, or `None` for packets that are not
    /// recorded. A repeated frame (same sender and packet id) is dropped so
    /// the stored message keeps its status.
    pub fn record(&self, packet: &Packet) -> Result<Option<StoredMessage>, StoreError> {
        let Some(text) = packet.text_message() else {
            return Ok(None);
        };
        if packet.from == self.local_node_id {
            // Our own frame echoed back by the radio
            return Ok(None);
        }

        let message = StoredMessage {
            id: Self::message_id(packet),
            sender: packet.from.clone(),
            sender_name: None,
            recipient: packet.to.clone(),
            recipient_name: None,
            content: text.text.clone(),
            timestamp: packet.timestamp,
            status: MessageStatus::Delivered,
            channel: text.channel,
            kind: MessageKind::Text,
            is_outgoing: false,
        };
        if !self.messages.save_if_absent(&message)? {
            debug!("Duplicate frame ignored: {}", message.id);
            return Ok(None);
        }
        debug!("Inbound message stored: {}", message.id);
        Ok(Some(message))
    }
}

impl PacketSubscriber for InboxRecorder {
    fn on_packet(&self, packet: &Packet) {
        if let Err(e) = self.record(packet) {
            error!("Failed to store message from {}: {}", packet.from, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Payload, TextMessage};
    use crate::store::MemoryStorage;
    use std::sync::Arc;

    fn recorder() -> InboxRecorder {
        InboxRecorder::new(MessageStore::new(Arc::new(MemoryStorage::new())), "me")
    }

    fn text(from: &str, id: u16, body: &str) -> Packet {
        Packet::new(
            from.to_string(),
            "me".to_string(),
            id,
            Payload::TextMessage(TextMessage {
                text: body.to_string(),
                channel: 3,
            }),
            1_234,
        )
    }

    #[test]
    fn test_records_inbound_text() {
        let recorder = recorder();
        let stored = recorder.record(&text("peer", 42, "hello")).unwrap().unwrap();

        assert_eq!(stored.id, "peer-42");
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert!(!stored.is_outgoing);
        assert_eq!(stored.channel, 3);
        assert_eq!(stored.timestamp, 1_234);

        let conversation = recorder.messages.conversation("peer").unwrap().unwrap();
        assert_eq!(conversation.unread_count, 1);
    }

    #[test]
    fn test_ignores_other_packets_and_own_echo() {
        let recorder = recorder();
        let ping = Packet::new("peer".into(), "me".into(), 1, Payload::Ping, 0);
        assert!(recorder.record(&ping).unwrap().is_none());
        assert!(recorder.record(&text("me", 2, "echo")).unwrap().is_none());
        assert_eq!(recorder.messages.count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_frame_stored_once() {
        let recorder = recorder();
        recorder.on_packet(&text("peer", 7, "again"));
        recorder.on_packet(&text("peer", 7, "again"));

        assert_eq!(recorder.messages.count().unwrap(), 1);
        let conversation = recorder.messages.conversation("peer").unwrap().unwrap();
        assert_eq!(conversation.unread_count, 1);
    }

    #[test]
    fn test_repeated_frame_keeps_read_status() {
        let recorder = recorder();
        recorder.record(&text("peer", 9, "relayed")).unwrap();
        recorder.messages.mark_conversation_read("peer").unwrap();

        // Same frame arriving again through a repeater
        assert!(recorder.record(&text("peer", 9, "relayed")).unwrap().is_none());

        let stored = recorder.messages.get("peer-9").unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        let conversation = recorder.messages.conversation("peer").unwrap().unwrap();
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.last_message.status, MessageStatus::Read);
    }
}
