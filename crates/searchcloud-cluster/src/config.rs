//! Cluster configuration.

use crate::topology::DEFAULT_TOPOLOGY;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default coordination service port.
pub const DEFAULT_COORDINATION_PORT: u16 = 8889;

/// Default configuration set name.
pub const DEFAULT_CONFIG_NAME: &str = "searchcloud-config";

/// Immutable description of the cluster a manager brings up.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Root data directory (coordination state and node cores).
    pub data_dir: PathBuf,

    /// Directory holding the configuration set to upload.
    pub conf_dir: PathBuf,

    /// Number of nodes in the cluster.
    pub node_count: usize,

    /// Port reserved for the coordination service (0 picks an ephemeral one).
    pub coordination_port: u16,

    /// Isolation namespace inside the coordination service, empty for root.
    pub chroot: String,

    /// Topology descriptor text distributed to every node.
    pub topology: String,

    /// Name the configuration set is uploaded under.
    pub config_name: String,

    /// Bound on bringing up the coordination service and the nodes.
    pub startup_timeout: Duration,

    /// Bound on individual coordination requests and collection placement.
    pub operation_timeout: Duration,
}

impl ClusterConfig {
    /// Creates a configuration with default port, namespace, topology and
    /// timeouts.
    pub fn new(data_dir: PathBuf, conf_dir: PathBuf, node_count: usize) -> Result<Self> {
        if node_count == 0 {
            return Err(Error::InvalidNodeCount(node_count));
        }

        Ok(Self {
            data_dir,
            conf_dir,
            node_count,
            coordination_port: DEFAULT_COORDINATION_PORT,
            chroot: String::new(),
            topology: DEFAULT_TOPOLOGY.to_string(),
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            startup_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(15),
        })
    }

    /// Sets the coordination service port.
    pub fn with_coordination_port(mut self, port: u16) -> Self {
        self.coordination_port = port;
        self
    }

    /// Sets the isolation namespace.
    pub fn with_chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = chroot.into();
        self
    }

    /// Sets the topology descriptor text.
    pub fn with_topology(mut self, topology: impl Into<String>) -> Self {
        self.topology = topology.into();
        self
    }

    /// Sets the configuration set name.
    pub fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    /// Sets the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Returns the coordination service's data directory.
    pub fn coordination_dir(&self) -> PathBuf {
        coordination_dir(&self.data_dir)
    }
}

/// Coordination service data directory under a cluster data directory.
pub fn coordination_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("coordination").join("server1").join("data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cluster_config_creation() {
        let temp = TempDir::new().unwrap();
        let config = ClusterConfig::new(temp.path().join("data"), temp.path().join("conf"), 3)
            .unwrap();

        assert_eq!(config.node_count, 3);
        assert_eq!(config.coordination_port, DEFAULT_COORDINATION_PORT);
        assert_eq!(config.config_name, DEFAULT_CONFIG_NAME);
        assert!(config.chroot.is_empty());
        assert_eq!(config.topology, DEFAULT_TOPOLOGY);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let temp = TempDir::new().unwrap();
        let result = ClusterConfig::new(temp.path().join("data"), temp.path().join("conf"), 0);
        assert!(matches!(result, Err(Error::InvalidNodeCount(0))));
    }

    #[test]
    fn test_builders() {
        let temp = TempDir::new().unwrap();
        let config = ClusterConfig::new(temp.path().join("data"), temp.path().join("conf"), 1)
            .unwrap()
            .with_coordination_port(0)
            .with_chroot("/it")
            .with_config_name("custom")
            .with_startup_timeout(Duration::from_secs(1));

        assert_eq!(config.coordination_port, 0);
        assert_eq!(config.chroot, "/it");
        assert_eq!(config.config_name, "custom");
        assert_eq!(config.startup_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_coordination_dir() {
        let config = ClusterConfig::new(PathBuf::from("/tmp/sc"), PathBuf::from("/tmp/conf"), 1)
            .unwrap();
        assert_eq!(
            config.coordination_dir(),
            PathBuf::from("/tmp/sc/coordination/server1/data")
        );
    }
}
