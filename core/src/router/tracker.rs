// Node presence tracking
//
// Every inbound packet refreshes its sender's record; NODE_INFO, TELEMETRY
// and POSITION payloads fill in the details.

use super::PacketSubscriber;
use crate::protocol::{Packet, Payload};
use crate::store::{NodeSort, NodeStore, StoreError, StoredNode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Nodes not heard from within this window are offline
pub const ONLINE_THRESHOLD_MS: u64 = 5 * 60 * 1000;

/// Battery percentage below which a node is flagged
pub const LOW_BATTERY_THRESHOLD: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub online_threshold_ms: u64,
    pub low_battery_threshold: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            online_threshold_ms: ONLINE_THRESHOLD_MS,
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
        }
    }
}

pub struct NodeTracker {
    nodes: NodeStore,
    config: NodeConfig,
}

impl NodeTracker {
    pub fn new(nodes: NodeStore, config: NodeConfig) -> Self {
        Self { nodes, config }
    }

    pub fn store(&self) -> &NodeStore {
        &self.nodes
    }

    /// Create or refresh the sender of `packet` and apply its payload
    pub fn record(&self, packet: &Packet) -> Result<StoredNode, StoreError> {
        let mut node = match self.nodes.get(&packet.from)? {
            Some(mut node) => {
                node.last_seen = packet.timestamp;
                node.is_online = true;
                node
            }
            None => StoredNode::discovered(&packet.from, packet.timestamp),
        };

        match &packet.payload {
            Payload::NodeInfo(info) => {
                if !info.name.is_empty() {
                    node.name = info.name.clone();
                }
                node.hardware_model = Some(info.hardware_model.clone());
                node.firmware_version = Some(info.firmware_version.clone());
                node.public_key = Some(info.node_hash.clone());
            }
            Payload::Telemetry(telemetry) => {
                if let Some(level) = telemetry.battery_level {
                    node.battery_level = Some(level);
                }
            }
            Payload::Position(position) => {
                node.latitude = Some(position.latitude);
                node.longitude = Some(position.longitude);
                node.altitude = position.altitude;
            }
            _ => {}
        }

        self.nodes.save(&node)?;
        debug!("Node updated: {}", node.node_hash);
        Ok(node)
    }

    /// Record link metrics reported by the radio for a known node.
    ///
    /// Returns `Ok(false)` if the node has never been heard from.
    pub fn update_signal_strength(
        &self,
        node_hash: &str,
        rssi: i32,
        snr: Option<f64>,
        now: u64,
    ) -> Result<bool, StoreError> {
        let Some(mut node) = self.nodes.get(node_hash)? else {
            return Ok(false);
        };
        node.rssi = Some(rssi);
        if snr.is_some() {
            node.snr = snr;
        }
        node.last_seen = now;
        node.is_online = true;
        self.nodes.save(&node)?;
        debug!("Signal strength updated: {} {} dBm", node_hash, rssi);
        Ok(true)
    }

    /// Flip nodes online/offline by last-seen age. Returns how many changed.
    pub fn refresh_online_status(&self, now: u64) -> Result<usize, StoreError> {
        let mut changed = 0;
        for mut node in self.nodes.list(NodeSort::LastSeen)? {
            let online = now.saturating_sub(node.last_seen) < self.config.online_threshold_ms;
            if node.is_online != online {
                node.is_online = online;
                self.nodes.save(&node)?;
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Online status changed for {} nodes", changed);
        }
        Ok(changed)
    }

    pub fn nodes(&self, sort: NodeSort) -> Result<Vec<StoredNode>, StoreError> {
        self.nodes.list(sort)
    }

    pub fn online_nodes(&self) -> Result<Vec<StoredNode>, StoreError> {
        self.nodes.online()
    }

    pub fn low_battery_nodes(&self) -> Result<Vec<StoredNode>, StoreError> {
        self.nodes.low_battery(self.config.low_battery_threshold)
    }

    pub fn located_nodes(&self) -> Result<Vec<StoredNode>, StoreError> {
        self.nodes.with_location()
    }

    pub fn average_battery_level(&self) -> Result<f64, StoreError> {
        self.nodes.average_battery_level()
    }
}

impl PacketSubscriber for NodeTracker {
    fn on_packet(&self, packet: &Packet) {
        if let Err(e) = self.record(packet) {
            error!("Failed to record node {}: {}", packet.from, e);
        }
    }
}
