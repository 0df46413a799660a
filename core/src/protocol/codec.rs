// Frame codec: packet <-> bytes with CRC-16 integrity
//
// Format (total overhead: 6 bytes):
// [1 byte]  magic 0xAA
// [1 byte]  packet type
// [2 bytes] body length L (LE u16)
// [L bytes] body: the whole packet as UTF-8 JSON
// [2 bytes] CRC-16 over magic + type + length + body (LE u16)

use super::crc::crc16;
use super::types::{Ack, NodeInfo, Packet, Payload, Position, Telemetry, TextMessage};
use super::{DecodeError, ProtocolError, CRC_LEN, FRAME_MAGIC, HEADER_LEN, MAX_BODY_LEN, MIN_FRAME_LEN};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::atomic::{AtomicU16, Ordering};

/// Serialize a packet into a wire frame
pub fn frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(packet).map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::PayloadTooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + CRC_LEN);
    buf.push(FRAME_MAGIC);
    buf.push(packet.packet_type().as_u8());
    buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
    buf.extend_from_slice(&body);

    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Deserialize a wire frame.
///
/// Checks run in a fixed order and stop at the first failure:
/// length floor, magic, declared length, CRC, then the JSON body.
/// Bytes after the CRC trailer are ignored.
///
/// Stricter than a plain JSON parse: a body whose `type` disagrees with the
/// header type byte is rejected as malformed even when the JSON is valid, so
/// peers that tag frames inconsistently are dropped rather than accepted.
pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort { got: data.len() });
    }

    if data[0] != FRAME_MAGIC {
        return Err(DecodeError::BadMagic(data[0]));
    }

    let header_type = data[1];
    let body_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    let crc_offset = HEADER_LEN + body_len;
    let need = crc_offset + CRC_LEN;
    if data.len() < need {
        return Err(DecodeError::Truncated {
            need,
            got: data.len(),
        });
    }

    let received = u16::from_le_bytes([data[crc_offset], data[crc_offset + 1]]);
    let computed = crc16(&data[..crc_offset]);
    if received != computed {
        return Err(DecodeError::CrcMismatch { received, computed });
    }

    let body = std::str::from_utf8(&data[HEADER_LEN..crc_offset])
        .map_err(|e| DecodeError::MalformedPayload(format!("body is not UTF-8: {e}")))?;
    let packet: Packet =
        serde_json::from_str(body).map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    if packet.packet_type().as_u8() != header_type {
        return Err(DecodeError::MalformedPayload(format!(
            "header type {:#04x} disagrees with body type {}",
            header_type,
            packet.packet_type()
        )));
    }

    Ok(packet)
}

/// Base64 packaging for transports that only carry text
pub fn armor(frame: &[u8]) -> String {
    STANDARD.encode(frame)
}

/// Undo [`armor`] and decode the frame inside
pub fn dearmor(text: &str) -> Result<Packet, DecodeError> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| DecodeError::InvalidArmor(e.to_string()))?;
    decode(&bytes)
}

/// A freshly built packet together with its frame
#[derive(Debug, Clone)]
pub struct Encoded {
    pub packet: Packet,
    pub bytes: Vec<u8>,
}

impl Encoded {
    pub fn id(&self) -> u16 {
        self.packet.id
    }

    pub fn armored(&self) -> String {
        armor(&self.bytes)
    }
}

/// Sender-side encoder.
///
/// Owns the packet id counter: every encode call consumes exactly one id,
/// ids start at 1 and wrap from 65535 to 0.
#[derive(Debug, Default)]
pub struct PacketCodec {
    last_id: AtomicU16,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume numbering after `last_id` (e.g. restored from a previous session)
    pub fn with_last_id(last_id: u16) -> Self {
        Self {
            last_id: AtomicU16::new(last_id),
        }
    }

    fn next_packet_id(&self) -> u16 {
        // fetch_add wraps on overflow
        self.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Most recently assigned id (0 before the first encode)
    pub fn last_packet_id(&self) -> u16 {
        self.last_id.load(Ordering::Relaxed)
    }

    /// Build a packet with the next id and the current time, then frame it
    pub fn encode(&self, from: &str, to: &str, payload: Payload) -> Result<Encoded, ProtocolError> {
        let packet = Packet::new(
            from.to_string(),
            to.to_string(),
            self.next_packet_id(),
            payload,
            crate::current_timestamp_ms(),
        );
        let bytes = frame(&packet)?;
        Ok(Encoded { packet, bytes })
    }

    pub fn encode_text_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        channel: u8,
    ) -> Result<Encoded, ProtocolError> {
        self.encode(
            from,
            to,
            Payload::TextMessage(TextMessage {
                text: text.to_string(),
                channel,
            }),
        )
    }

    pub fn encode_position(
        &self,
        from: &str,
        to: &str,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
        accuracy: Option<f64>,
    ) -> Result<Encoded, ProtocolError> {
        self.encode(
            from,
            to,
            Payload::Position(Position {
                latitude,
                longitude,
                altitude,
                accuracy,
            }),
        )
    }

    pub fn encode_telemetry(
        &self,
        from: &str,
        to: &str,
        telemetry: Telemetry,
    ) -> Result<Encoded, ProtocolError> {
        self.encode(from, to, Payload::Telemetry(telemetry))
    }

    pub fn encode_node_info(
        &self,
        from: &str,
        to: &str,
        info: NodeInfo,
    ) -> Result<Encoded, ProtocolError> {
        self.encode(from, to, Payload::NodeInfo(info))
    }

    pub fn encode_ack(
        &self,
        from: &str,
        to: &str,
        packet_id: u16,
        success: bool,
    ) -> Result<Encoded, ProtocolError> {
        self.encode(from, to, Payload::Ack(Ack { packet_id, success }))
    }

    pub fn encode_ping(&self, from: &str, to: &str) -> Result<Encoded, ProtocolError> {
        self.encode(from, to, Payload::Ping)
    }

    pub fn encode_pong(&self, from: &str, to: &str) -> Result<Encoded, ProtocolError> {
        self.encode(from, to, Payload::Pong)
    }
}
