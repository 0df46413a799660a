//! MeshCore wire protocol: binary framing around a JSON packet body
//!
//! This module provides:
//! - Packet: typed view of one mesh packet (header fields + typed payload)
//! - Frame codec: `[0xAA][type][LE u16 length][JSON][LE u16 CRC-16]`
//! - PacketCodec: sender-side encoder that owns the packet id counter
//! - Armor: base64 packaging for text-only transports
//!
//! Format progression:
//! 1. Packet: header fields plus a payload variant keyed by packet type
//! 2. JSON body: the whole packet serialized as a UTF-8 object
//! 3. Frame: magic, type tag, body length, body, CRC-16/ARC trailer
//! 4. Optional armor: base64 string for BLE characteristic writes

pub mod codec;
pub mod crc;
pub mod types;

pub use codec::{armor, dearmor, decode, frame, Encoded, PacketCodec};
pub use crc::crc16;
pub use types::{
    Ack, NodeInfo, Packet, PacketType, Payload, Position, Telemetry, TextMessage,
    BROADCAST_ADDRESS,
};

use thiserror::Error;

/// Frame magic byte
pub const FRAME_MAGIC: u8 = 0xAA;

/// Header size: magic + type + 2 length bytes
pub const HEADER_LEN: usize = 4;

/// Trailer size: CRC-16
pub const CRC_LEN: usize = 2;

/// Smallest buffer that can possibly hold a frame (empty body)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;

/// Largest body the 16-bit length field can describe
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Reasons an inbound frame is rejected, in validation order
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame too short: {got} bytes (min {MIN_FRAME_LEN})")]
    TooShort { got: usize },

    #[error("Bad magic byte: {0:#04x}")]
    BadMagic(u8),

    #[error("Truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid armor: {0}")]
    InvalidArmor(String),
}

/// Encode-side failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Payload too large: {0} bytes (max {MAX_BODY_LEN})")]
    PayloadTooLarge(usize),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
