//! Topology descriptor: bootstrap settings shared by every node.
//!
//! The descriptor travels as text. The cluster publishes it in the
//! coordination service and each node parses it at boot, so a malformed
//! descriptor surfaces as nodes failing to become ready.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Path of the descriptor inside the isolation namespace.
pub const TOPOLOGY_PATH: &str = "/cluster.toml";

/// Descriptor used when the caller does not supply one.
pub const DEFAULT_TOPOLOGY: &str = r#"# Bootstrap settings shared by every node of the cluster.

[node]
# Interface nodes bind to. Ports are always allocated dynamically.
host = "127.0.0.1"

# Upper bound on cores (shard replicas) a single node will host.
max_cores_per_node = 64
"#;

/// Parsed topology descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    pub node: NodeSettings,
}

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSettings {
    pub host: String,
    pub max_cores_per_node: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            max_cores_per_node: 64,
        }
    }
}

impl Topology {
    /// Parses a descriptor.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor_parses() {
        let topology = Topology::parse(DEFAULT_TOPOLOGY).unwrap();
        assert_eq!(topology.node, NodeSettings::default());
    }

    #[test]
    fn test_partial_descriptor_uses_defaults() {
        let topology = Topology::parse("[node]\nmax_cores_per_node = 2\n").unwrap();
        assert_eq!(topology.node.host, "127.0.0.1");
        assert_eq!(topology.node.max_cores_per_node, 2);
    }

    #[test]
    fn test_malformed_descriptor_is_rejected() {
        assert!(Topology::parse("<solr></solr>").is_err());
        assert!(Topology::parse("[node]\nbogus = 1\n").is_err());
        assert!(Topology::parse("").is_err());
    }
}
