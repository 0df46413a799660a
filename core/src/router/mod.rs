//! Inbound packet dispatch
//!
//! Raw frames from the transport are decoded once and the resulting
//! [`Packet`] is handed to every registered [`PacketSubscriber`]. Frames that
//! fail to decode are logged and dropped; there is no retransmission at this
//! layer.

pub mod inbox;
pub mod tracker;

pub use inbox::InboxRecorder;
pub use tracker::{NodeConfig, NodeTracker};

use crate::protocol::{decode, dearmor, DecodeError, Packet};
use crate::subscription::{Observers, SubscriptionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver of decoded inbound packets
#[cfg_attr(test, mockall::automock)]
pub trait PacketSubscriber: Send + Sync {
    fn on_packet(&self, packet: &Packet);
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub dispatched: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct PacketRouter {
    subscribers: Observers<dyn PacketSubscriber>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn PacketSubscriber>) -> SubscriptionId {
        self.subscribers.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Decode one frame and fan it out. Returns the packet if it decoded.
    pub fn dispatch(&self, frame: &[u8]) -> Option<Packet> {
        self.deliver(decode(frame), frame.len(), || hex::encode(frame))
    }

    /// Same as [`dispatch`](Self::dispatch) for base64-armored frames
    pub fn dispatch_armored(&self, text: &str) -> Option<Packet> {
        self.deliver(dearmor(text), text.len(), || text.to_string())
    }

    /// Fan out an already-decoded packet
    pub fn dispatch_packet(&self, packet: &Packet) {
        debug!(
            "Dispatching {} #{} from {}",
            packet.packet_type(),
            packet.id,
            packet.from
        );
        for subscriber in self.subscribers.snapshot() {
            subscriber.on_packet(packet);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn deliver(
        &self,
        decoded: Result<Packet, DecodeError>,
        len: usize,
        raw: impl FnOnce() -> String,
    ) -> Option<Packet> {
        match decoded {
            Ok(packet) => {
                self.dispatch_packet(&packet);
                Some(packet)
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping inbound frame ({} bytes): {}", len, e);
                debug!("Dropped frame: {}", raw());
                None
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
