//! Configuration management for the searchcloud driver
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence)
//! 2. Environment variables (SCLOUD_* prefix, `__` between nested keys)
//! 3. searchcloud.local.toml (gitignored, local overrides)
//! 4. searchcloud.toml (git-tracked, project config)
//! 5. ~/.config/searchcloud/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCloudConfig {
    /// Do nothing at all when set.
    pub skip: bool,

    /// Cluster data directory. A fresh temporary directory is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    pub coordination: CoordinationConfig,
    pub cluster: ClusterConfig,
    pub config_set: ConfigSetConfig,
    pub collections: CollectionsConfig,
    pub cleanup: CleanupConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub port: u16,
    pub chroot: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            port: 8889,
            chroot: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: usize,

    /// Topology descriptor file. The built-in descriptor is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_file: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            topology_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSetConfig {
    pub name: String,
    pub upload: bool,
    pub dir: PathBuf,
}

impl Default for ConfigSetConfig {
    fn default() -> Self {
        Self {
            name: "searchcloud-config".to_string(),
            upload: true,
            dir: PathBuf::from("target/searchcloud/conf"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionsConfig {
    pub create: bool,
    pub names: Vec<String>,
    pub shards: usize,
    pub replicas: usize,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            create: true,
            names: vec!["default".to_string()],
            shards: 1,
            replicas: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub data_dir: bool,
    pub conf_dir: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            data_dir: true,
            conf_dir: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub startup_secs: u64,
    pub operation_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: 30,
            operation_secs: 15,
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }
}

impl SearchCloudConfig {
    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if let Some(data_dir) = &mut self.data_dir {
            if data_dir.is_relative() {
                *data_dir = base.join(&*data_dir);
            }
        }

        if self.config_set.dir.is_relative() {
            self.config_set.dir = base.join(&self.config_set.dir);
        }

        if let Some(topology_file) = &mut self.cluster.topology_file {
            if topology_file.is_relative() {
                *topology_file = base.join(&*topology_file);
            }
        }
    }

    /// Rejects values the cluster would refuse later anyway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.nodes == 0 {
            return Err(ConfigError::Validation(
                "cluster.nodes must be at least 1".to_string(),
            ));
        }
        if self.config_set.name.is_empty() {
            return Err(ConfigError::Validation(
                "config_set.name must not be empty".to_string(),
            ));
        }
        if self.collections.create {
            if self.collections.shards == 0 || self.collections.replicas == 0 {
                return Err(ConfigError::Validation(
                    "collections.shards and collections.replicas must be at least 1".to_string(),
                ));
            }
            if let Some(name) = self.collections.names.iter().find(|n| n.is_empty() || n.contains('/')) {
                return Err(ConfigError::Validation(format!(
                    "invalid collection name {name:?}"
                )));
            }
        }
        Ok(())
    }

    /// Reads the custom topology descriptor, if one is configured.
    pub fn topology(&self) -> Result<Option<String>, ConfigError> {
        self.cluster
            .topology_file
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path).map_err(|source| ConfigError::TopologyRead {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
