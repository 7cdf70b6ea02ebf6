//! meshd.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    pub host: Option<HostConfig>,
    pub flow: Option<FlowConfig>,
    pub updater: Option<UpdaterConfig>,
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host identity embedded in every node/edge this agent publishes.
    /// Defaults to the system hostname.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Seconds a flow may stay idle before it expires from the table.
    pub expire: Option<u64>,
    /// Seconds between flow table update ticks.
    pub update: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Bound of the node-updater channel; overflow drops the oldest entry.
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the durable flow store. In-memory when unset.
    pub path: Option<String>,
}

pub const DEFAULT_FLOW_EXPIRE_SECS: u64 = 600;
pub const DEFAULT_FLOW_UPDATE_SECS: u64 = 60;
pub const DEFAULT_UPDATER_CAPACITY: usize = 500;

impl MeshConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let config: MeshConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    pub fn host_name(&self) -> String {
        self.host
            .as_ref()
            .and_then(|h| h.name.clone())
            .unwrap_or_else(|| {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            })
    }

    pub fn flow_expire_secs(&self) -> u64 {
        self.flow
            .as_ref()
            .and_then(|f| f.expire)
            .unwrap_or(DEFAULT_FLOW_EXPIRE_SECS)
    }

    pub fn flow_update_secs(&self) -> u64 {
        self.flow
            .as_ref()
            .and_then(|f| f.update)
            .unwrap_or(DEFAULT_FLOW_UPDATE_SECS)
    }

    pub fn updater_capacity(&self) -> usize {
        self.updater
            .as_ref()
            .and_then(|u| u.channel_capacity)
            .unwrap_or(DEFAULT_UPDATER_CAPACITY)
    }

    pub fn storage_path(&self) -> Option<&str> {
        self.storage.as_ref().and_then(|s| s.path.as_deref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(String, String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
