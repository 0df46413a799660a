// Configuration for a MeshLink instance
//
// Stored as JSON with camelCase keys; every field has a default so partial
// files are accepted. Default locations:
// - Linux: ~/.local/share/meshlink
// - macOS: ~/Library/Application Support/meshlink
// - Windows: %LOCALAPPDATA%\meshlink

use crate::delivery::DeliveryConfig;
use crate::logging::LoggingConfig;
use crate::router::NodeConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid log filter: {0}")]
    LogFilter(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshLinkConfig {
    /// sled directory; in-memory storage when unset
    pub storage_path: Option<PathBuf>,

    /// Sender id put on outbound frames
    pub local_node_id: String,

    pub delivery: DeliveryConfig,

    pub nodes: NodeConfig,

    pub logging: LoggingConfig,
}

impl Default for MeshLinkConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            local_node_id: "local".to_string(),
            delivery: DeliveryConfig::default(),
            nodes: NodeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MeshLinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_node_id.is_empty() {
            return Err(ConfigError::Invalid("localNodeId must not be empty".into()));
        }
        self.delivery
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.nodes.online_threshold_ms == 0 {
            return Err(ConfigError::Invalid(
                "nodes.onlineThresholdMs must be positive".into(),
            ));
        }
        self.logging.env_filter()?;
        Ok(())
    }

    /// Platform data directory for MeshLink
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("meshlink"))
    }

    /// Read and validate a config file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MeshLinkConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate().context("Config file failed validation")?;
        Ok(config)
    }

    /// Load `path`, writing the defaults there first if it does not exist
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
