//! Ephemeral search cluster management for integration tests.
//!
//! Provides the lifecycle of a throwaway multi-node cluster:
//! - An embedded coordination service nodes register with
//! - N worker nodes booted from a shared topology descriptor
//! - Configuration set upload and collection creation
//! - Ordered teardown and ownership-aware directory cleanup
//!
//! [`ClusterLifecycleManager`] is the entry point. Drive it in the order
//! `start_cluster → upload_config → create_collection* → stop_cluster`, then
//! request cleanup explicitly.

pub mod cluster;
pub mod config;
pub mod coordination;
pub mod distributor;
pub mod error;
pub mod manager;
pub mod node;
pub mod ownership;
pub mod topology;

pub use cluster::{ClusterHandle, CollectionSpec, CollectionState};
pub use config::ClusterConfig;
pub use coordination::{CoordinationAddress, CoordinationClient, CoordinationServer};
pub use distributor::ConfigDistributor;
pub use error::{Error, Result};
pub use manager::{CleanOutcome, ClusterLifecycleManager, ClusterState};
pub use node::{NodeProcess, NodeStatus};
pub use ownership::DirectoryOwnershipTracker;
pub use topology::{DEFAULT_TOPOLOGY, Topology};

/// Builds a manager and starts its cluster.
pub async fn start_cluster(config: ClusterConfig) -> Result<ClusterLifecycleManager> {
    let manager = ClusterLifecycleManager::new(config)?;
    manager.start_cluster().await?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_cluster() {
        let temp = TempDir::new().unwrap();
        let config = ClusterConfig::new(temp.path().join("data"), temp.path().join("conf"), 2)
            .unwrap()
            .with_coordination_port(0)
            .with_startup_timeout(Duration::from_secs(5));

        let manager = start_cluster(config).await.unwrap();
        assert_eq!(manager.state().await, ClusterState::Running);
        assert!(temp.path().join("data").join("node-1").exists());

        manager.stop_cluster().await.unwrap();
        assert_eq!(manager.state().await, ClusterState::Stopped);
    }
}
