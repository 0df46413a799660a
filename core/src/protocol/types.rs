// Packet types: what actually travels between the phone and the radio

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Sentinel recipient meaning "every node in range"
pub const BROADCAST_ADDRESS: &str = "broadcast";

/// Packet type tag, carried both in the frame header and in the JSON body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PacketType {
    /// Chat text on a channel or to a single node (0x01)
    TextMessage = 0x01,
    /// GPS fix (0x02)
    Position = 0x02,
    /// Battery and environment sensors (0x03)
    Telemetry = 0x03,
    /// Node identity announcement (0x04)
    NodeInfo = 0x04,
    /// Acknowledgement of a previously received packet id (0x05)
    Ack = 0x05,
    /// Liveness probe (0x06)
    Ping = 0x06,
    /// Liveness reply (0x07)
    Pong = 0x07,
}

impl PacketType {
    /// Convert from the wire tag
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::TextMessage),
            0x02 => Some(PacketType::Position),
            0x03 => Some(PacketType::Telemetry),
            0x04 => Some(PacketType::NodeInfo),
            0x05 => Some(PacketType::Ack),
            0x06 => Some(PacketType::Ping),
            0x07 => Some(PacketType::Pong),
            _ => None,
        }
    }

    /// Convert to the wire tag
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PacketType::from_u8(value).ok_or_else(|| format!("unknown packet type {value:#04x}"))
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::TextMessage => write!(f, "TEXT_MESSAGE"),
            PacketType::Position => write!(f, "POSITION"),
            PacketType::Telemetry => write!(f, "TELEMETRY"),
            PacketType::NodeInfo => write!(f, "NODE_INFO"),
            PacketType::Ack => write!(f, "ACK"),
            PacketType::Ping => write!(f, "PING"),
            PacketType::Pong => write!(f, "PONG"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessage {
    pub text: String,
    /// Logical broadcast group; absent on the wire means the primary channel
    #[serde(default)]
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_hash: String,
    pub name: String,
    pub hardware_model: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub packet_id: u16,
    pub success: bool,
}

/// Payload variant; its discriminant is the packet type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    TextMessage(TextMessage),
    Position(Position),
    Telemetry(Telemetry),
    NodeInfo(NodeInfo),
    Ack(Ack),
    Ping,
    Pong,
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::TextMessage(_) => PacketType::TextMessage,
            Payload::Position(_) => PacketType::Position,
            Payload::Telemetry(_) => PacketType::Telemetry,
            Payload::NodeInfo(_) => PacketType::NodeInfo,
            Payload::Ack(_) => PacketType::Ack,
            Payload::Ping => PacketType::Ping,
            Payload::Pong => PacketType::Pong,
        }
    }

    /// Interpret a JSON payload object according to `packet_type`
    pub fn from_value(
        packet_type: PacketType,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match packet_type {
            PacketType::TextMessage => Payload::TextMessage(serde_json::from_value(value)?),
            PacketType::Position => Payload::Position(serde_json::from_value(value)?),
            PacketType::Telemetry => Payload::Telemetry(serde_json::from_value(value)?),
            PacketType::NodeInfo => Payload::NodeInfo(serde_json::from_value(value)?),
            PacketType::Ack => Payload::Ack(serde_json::from_value(value)?),
            // Body content is irrelevant for liveness packets
            PacketType::Ping => Payload::Ping,
            PacketType::Pong => Payload::Pong,
        })
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::TextMessage(p) => p.serialize(serializer),
            Payload::Position(p) => p.serialize(serializer),
            Payload::Telemetry(p) => p.serialize(serializer),
            Payload::NodeInfo(p) => p.serialize(serializer),
            Payload::Ack(p) => p.serialize(serializer),
            Payload::Ping | Payload::Pong => serializer.serialize_map(Some(0))?.end(),
        }
    }
}

/// One mesh packet.
///
/// Immutable once framed. `id` is unique per sending codec instance only,
/// it wraps at 65536 and says nothing about other senders.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WirePacket")]
pub struct Packet {
    /// Sender node hash
    pub from: String,
    /// Recipient node hash, or [`BROADCAST_ADDRESS`]
    pub to: String,
    /// Sender-assigned sequence number
    pub id: u16,
    pub payload: Payload,
    /// Sender-local milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Packet {
    pub fn new(from: String, to: String, id: u16, payload: Payload, timestamp: u64) -> Self {
        Self {
            from,
            to,
            id,
            payload,
            timestamp,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDRESS
    }

    /// Text payload, only if this is a TEXT_MESSAGE packet
    pub fn text_message(&self) -> Option<&TextMessage> {
        match &self.payload {
            Payload::TextMessage(p) => Some(p),
            _ => None,
        }
    }

    /// Position payload, only if this is a POSITION packet
    pub fn position(&self) -> Option<&Position> {
        match &self.payload {
            Payload::Position(p) => Some(p),
            _ => None,
        }
    }

    /// Telemetry payload, only if this is a TELEMETRY packet
    pub fn telemetry(&self) -> Option<&Telemetry> {
        match &self.payload {
            Payload::Telemetry(p) => Some(p),
            _ => None,
        }
    }

    pub fn node_info(&self) -> Option<&NodeInfo> {
        match &self.payload {
            Payload::NodeInfo(p) => Some(p),
            _ => None,
        }
    }

    /// Ack payload, only if this is an ACK packet
    pub fn ack(&self) -> Option<&Ack> {
        match &self.payload {
            Payload::Ack(p) => Some(p),
            _ => None,
        }
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WirePacketRef {
            packet_type: self.packet_type(),
            from: &self.from,
            to: &self.to,
            id: self.id,
            payload: &self.payload,
            timestamp: self.timestamp,
        }
        .serialize(serializer)
    }
}

/// JSON body layout. Field order matches what deployed firmware emits.
#[derive(Serialize)]
struct WirePacketRef<'a> {
    #[serde(rename = "type")]
    packet_type: PacketType,
    from: &'a str,
    to: &'a str,
    id: u16,
    payload: &'a Payload,
    timestamp: u64,
}

#[derive(Deserialize)]
struct WirePacket {
    #[serde(rename = "type")]
    packet_type: PacketType,
    from: String,
    to: String,
    id: u16,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: u64,
}

impl TryFrom<WirePacket> for Packet {
    type Error = String;

    fn try_from(wire: WirePacket) -> Result<Self, Self::Error> {
        let payload = Payload::from_value(wire.packet_type, wire.payload)
            .map_err(|e| format!("{} payload: {}", wire.packet_type, e))?;
        Ok(Packet {
            from: wire.from,
            to: wire.to,
            id: wire.id,
            payload,
            timestamp: wire.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_packet() -> Packet {
        Packet::new(
            "node123".into(),
            "node456".into(),
            7,
            Payload::TextMessage(TextMessage {
                text: "Hello, MeshCore!".into(),
                channel: 0,
            }),
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::TextMessage.as_u8(), 0x01);
        assert_eq!(PacketType::Pong.as_u8(), 0x07);
        assert_eq!(PacketType::from_u8(0x05), Some(PacketType::Ack));
        assert_eq!(PacketType::from_u8(0x00), None);
        assert_eq!(PacketType::from_u8(0x99), None);
    }

    #[test]
    fn test_packet_json_shape() {
        let value = serde_json::to_value(text_packet()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": 1,
                "from": "node123",
                "to": "node456",
                "id": 7,
                "payload": { "text": "Hello, MeshCore!", "channel": 0 },
                "timestamp": 1_700_000_000_000u64,
            })
        );
    }

    #[test]
    fn test_position_omits_missing_optionals() {
        let packet = Packet::new(
            "a".into(),
            BROADCAST_ADDRESS.into(),
            1,
            Payload::Position(Position {
                latitude: 10.0,
                longitude: 20.0,
                altitude: None,
                accuracy: None,
            }),
            0,
        );
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["payload"], json!({ "latitude": 10.0, "longitude": 20.0 }));
        assert!(packet.is_broadcast());
    }

    #[test]
    fn test_ping_serializes_empty_object() {
        let packet = Packet::new("a".into(), "b".into(), 2, Payload::Ping, 0);
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["payload"], json!({}));
        assert_eq!(value["type"], json!(6));
    }

    #[test]
    fn test_telemetry_camel_case() {
        let value = json!({
            "type": 3, "from": "a", "to": "b", "id": 3, "timestamp": 5,
            "payload": { "batteryLevel": 85, "voltage": 3.7, "pressure": 1013.25 }
        });
        let packet: Packet = serde_json::from_value(value).unwrap();
        let telemetry = packet.telemetry().unwrap();
        assert_eq!(telemetry.battery_level, Some(85.0));
        assert_eq!(telemetry.voltage, Some(3.7));
        assert_eq!(telemetry.temperature, None);
        assert_eq!(telemetry.pressure, Some(1013.25));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let value = json!({
            "type": 1, "from": "a", "to": "b", "id": 3, "timestamp": 5,
            "payload": { "channel": 2 }
        });
        assert!(serde_json::from_value::<Packet>(value).is_err());

        let no_from = json!({
            "type": 6, "to": "b", "id": 3, "timestamp": 5, "payload": {}
        });
        assert!(serde_json::from_value::<Packet>(no_from).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let value = json!({
            "type": 42, "from": "a", "to": "b", "id": 3, "timestamp": 5, "payload": {}
        });
        assert!(serde_json::from_value::<Packet>(value).is_err());
    }

    #[test]
    fn test_accessors_narrow_by_type() {
        let packet = text_packet();
        assert!(packet.text_message().is_some());
        assert!(packet.position().is_none());
        assert!(packet.telemetry().is_none());
        assert!(packet.ack().is_none());
        assert!(packet.node_info().is_none());
    }

    #[test]
    fn test_text_channel_defaults_to_zero() {
        let value = json!({
            "type": 1, "from": "a", "to": "b", "id": 3, "timestamp": 5,
            "payload": { "text": "hi" }
        });
        let packet: Packet = serde_json::from_value(value).unwrap();
        assert_eq!(packet.text_message().unwrap().channel, 0);
    }
}
