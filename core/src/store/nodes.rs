// Node directory persistence
//
// One JSON record per node under `node_{nodeHash}`.

use super::backend::StorageBackend;
use super::StoreError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

const NODE_PREFIX: &str = "node_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Chat,
    Repeater,
    RoomServer,
    Sensor,
    Companion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNode {
    pub node_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub name: String,
    pub node_type: NodeType,
    pub is_online: bool,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
}

impl StoredNode {
    /// A freshly heard node: online, default chat type, short-hash name
    pub fn discovered(node_hash: &str, last_seen: u64) -> Self {
        Self {
            node_hash: node_hash.to_string(),
            public_key: None,
            name: super::default_node_name(node_hash),
            node_type: NodeType::Chat,
            is_online: true,
            last_seen,
            battery_level: None,
            rssi: None,
            snr: None,
            latitude: None,
            longitude: None,
            altitude: None,
            firmware_version: None,
            hardware_model: None,
        }
    }

    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Ordering for node listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeSort {
    /// Most recently seen first
    #[default]
    LastSeen,
    /// Alphabetical
    Name,
    /// Highest battery first; nodes without a reading last
    Battery,
}

/// Link quality bucket derived from RSSI (dBm)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i32) -> Self {
        if rssi >= -50 {
            SignalQuality::Excellent
        } else if rssi >= -70 {
            SignalQuality::Good
        } else if rssi >= -85 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

fn node_key(node_hash: &str) -> String {
    format!("{}{}", NODE_PREFIX, node_hash)
}

#[derive(Clone)]
pub struct NodeStore {
    backend: Arc<dyn StorageBackend>,
}

impl NodeStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Insert or replace a node record
    pub fn save(&self, node: &StoredNode) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(node)?;
        self.backend.put(node_key(&node.node_hash).as_bytes(), &bytes)?;
        self.backend.flush()?;
        debug!("Node saved: {}", node.node_hash);
        Ok(())
    }

    pub fn get(&self, node_hash: &str) -> Result<Option<StoredNode>, StoreError> {
        match self.backend.get(node_key(node_hash).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All nodes in the requested order
    pub fn list(&self, sort: NodeSort) -> Result<Vec<StoredNode>, StoreError> {
        let mut nodes = self
            .backend
            .scan_prefix(NODE_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect::<Result<Vec<StoredNode>, _>>()?;

        match sort {
            NodeSort::LastSeen => nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen)),
            NodeSort::Name => nodes.sort_by(|a, b| a.name.cmp(&b.name)),
            NodeSort::Battery => nodes.sort_by(|a, b| {
                let a_level = a.battery_level.unwrap_or(-1.0);
                let b_level = b.battery_level.unwrap_or(-1.0);
                b_level.partial_cmp(&a_level).unwrap_or(Ordering::Equal)
            }),
        }
        Ok(nodes)
    }

    /// Online nodes, most recently seen first
    pub fn online(&self) -> Result<Vec<StoredNode>, StoreError> {
        Ok(self
            .list(NodeSort::LastSeen)?
            .into_iter()
            .filter(|n| n.is_online)
            .collect())
    }

    /// Nodes reporting a battery level below `threshold` percent
    pub fn low_battery(&self, threshold: f64) -> Result<Vec<StoredNode>, StoreError> {
        Ok(self
            .list(NodeSort::LastSeen)?
            .into_iter()
            .filter(|n| n.battery_level.map_or(false, |level| level < threshold))
            .collect())
    }

    pub fn with_location(&self) -> Result<Vec<StoredNode>, StoreError> {
        Ok(self
            .list(NodeSort::LastSeen)?
            .into_iter()
            .filter(StoredNode::has_location)
            .collect())
    }

    /// Mean battery level over nodes that report one, rounded; 0 when none do
    pub fn average_battery_level(&self) -> Result<f64, StoreError> {
        let levels: Vec<f64> = self
            .list(NodeSort::LastSeen)?
            .into_iter()
            .filter_map(|n| n.battery_level)
            .collect();
        if levels.is_empty() {
            return Ok(0.0);
        }
        Ok((levels.iter().sum::<f64>() / levels.len() as f64).round())
    }

    pub fn delete(&self, node_hash: &str) -> Result<(), StoreError> {
        self.backend.remove(node_key(node_hash).as_bytes())?;
        self.backend.flush()
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.backend.clear_prefix(NODE_PREFIX.as_bytes())?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(NODE_PREFIX.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn store() -> NodeStore {
        NodeStore::new(Arc::new(MemoryStorage::new()))
    }

    fn node(hash: &str, name: &str, last_seen: u64, battery: Option<f64>) -> StoredNode {
        let mut node = StoredNode::discovered(hash, last_seen);
        node.name = name.to_string();
        node.battery_level = battery;
        node
    }

    #[test]
    fn test_discovered_defaults() {
        let node = StoredNode::discovered("a1b2c3d4e5f6", 42);
        assert_eq!(node.name, "a1b2c3d4");
        assert_eq!(node.node_type, NodeType::Chat);
        assert!(node.is_online);
        assert_eq!(node.last_seen, 42);
        assert!(!node.has_location());

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["nodeType"], "chat");
        assert_eq!(value["nodeHash"], "a1b2c3d4e5f6");
        assert!(value.get("batteryLevel").is_none());
    }

    #[test]
    fn test_save_get_delete() {
        let store = store();
        store.save(&node("n1", "alpha", 1, None)).unwrap();
        assert_eq!(store.get("n1").unwrap().unwrap().name, "alpha");
        assert!(store.get("n2").unwrap().is_none());

        store.delete("n1").unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_sorting() {
        let store = store();
        store.save(&node("n1", "charlie", 100, Some(50.0))).unwrap();
        store.save(&node("n2", "alpha", 300, None)).unwrap();
        store.save(&node("n3", "bravo", 200, Some(90.0))).unwrap();

        let names = |sort| -> Vec<String> {
            store.list(sort).unwrap().into_iter().map(|n| n.name).collect()
        };
        assert_eq!(names(NodeSort::LastSeen), vec!["alpha", "bravo", "charlie"]);
        assert_eq!(names(NodeSort::Name), vec!["alpha", "bravo", "charlie"]);
        assert_eq!(names(NodeSort::Battery), vec!["bravo", "charlie", "alpha"]);
    }

    #[test]
    fn test_filters_and_average() {
        let store = store();
        let mut located = node("n1", "a", 1, Some(15.0));
        located.latitude = Some(47.6);
        located.longitude = Some(-122.3);
        store.save(&located).unwrap();

        let mut offline = node("n2", "b", 2, Some(80.0));
        offline.is_online = false;
        store.save(&offline).unwrap();

        store.save(&node("n3", "c", 3, None)).unwrap();

        assert_eq!(store.online().unwrap().len(), 2);
        let low: Vec<_> = store.low_battery(20.0).unwrap().into_iter().map(|n| n.node_hash).collect();
        assert_eq!(low, vec!["n1"]);
        assert_eq!(store.with_location().unwrap().len(), 1);
        // (15 + 80) / 2 = 47.5
        assert_eq!(store.average_battery_level().unwrap(), 48.0);
    }

    #[test]
    fn test_average_without_readings() {
        let store = store();
        store.save(&node("n1", "a", 1, None)).unwrap();
        assert_eq!(store.average_battery_level().unwrap(), 0.0);
    }

    #[test]
    fn test_signal_quality() {
        assert_eq!(SignalQuality::from_rssi(-40), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-50), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-51), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-70), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-85), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rssi(-86), SignalQuality::Poor);
    }
}
