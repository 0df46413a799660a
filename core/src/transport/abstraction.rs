//! Transport abstraction layer for MeshLink
//!
//! The radio is reached over a single byte-stream link (BLE central, Web
//! Bluetooth, serial...). Implementations live outside this crate; the
//! delivery queue and packet router only see [`TransportPort`].

use crate::subscription::SubscriptionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Adapter power/permission state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl ConnectionState {
    /// Only a powered-on adapter can scan, connect or send
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::PoweredOn)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "Unknown"),
            ConnectionState::Resetting => write!(f, "Resetting"),
            ConnectionState::Unsupported => write!(f, "Unsupported"),
            ConnectionState::Unauthorized => write!(f, "Unauthorized"),
            ConnectionState::PoweredOff => write!(f, "PoweredOff"),
            ConnectionState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Events from the transport to its observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    /// Adapter state changed
    StateChanged(ConnectionState),
    /// Link to a device is up
    Connected { device_id: String },
    /// Link to a device went away (requested or not)
    Disconnected { device_id: String },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => write!(f, "StateChanged({})", state),
            TransportEvent::Connected { device_id } => {
                write!(f, "Connected {{ device_id: {} }}", device_id)
            }
            TransportEvent::Disconnected { device_id } => {
                write!(f, "Disconnected {{ device_id: {} }}", device_id)
            }
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    NotAvailable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Observer of adapter/link events
pub type EventCallback = dyn Fn(&TransportEvent) + Send + Sync;

/// Observer of raw inbound bytes (one frame per call)
pub type DataCallback = dyn Fn(&[u8]) + Send + Sync;

/// The byte-stream link to one radio.
///
/// At most one device is connected at a time; connecting to a new device
/// implies dropping the previous link. A send failure of any kind (including
/// the platform's own timeout) is reported as an `Err` and nothing else.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Whether the platform has a usable radio stack at all
    fn is_available(&self) -> bool;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool;

    fn connected_device(&self) -> Option<String>;

    async fn connect(&self, device_id: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write one complete frame
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    fn on_state_change(&self, callback: Arc<EventCallback>) -> SubscriptionId;

    fn on_data_received(&self, callback: Arc<DataCallback>) -> SubscriptionId;

    /// Remove an observer registered with either `on_*` method
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::PoweredOn.to_string(), "PoweredOn");
        assert_eq!(ConnectionState::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(ConnectionState::default(), ConnectionState::Unknown);
    }

    #[test]
    fn test_only_powered_on_is_usable() {
        assert!(ConnectionState::PoweredOn.is_usable());
        for state in [
            ConnectionState::Unknown,
            ConnectionState::Resetting,
            ConnectionState::Unsupported,
            ConnectionState::Unauthorized,
            ConnectionState::PoweredOff,
        ] {
            assert!(!state.is_usable());
        }
    }

    #[test]
    fn test_transport_event_display() {
        let event = TransportEvent::Connected {
            device_id: "AA:BB".into(),
        };
        let display = format!("{}", event);
        assert!(display.contains("Connected"));
        assert!(display.contains("AA:BB"));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::NotConnected.to_string(), "Not connected");
        assert!(TransportError::SendFailed("gatt write".into())
            .to_string()
            .contains("gatt write"));
    }
}
