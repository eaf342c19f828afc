//! Node cluster handle: boots N nodes against a coordination service and
//! places collections on them.

use crate::coordination::{CoordinationAddress, CoordinationClient, protocol};
use crate::distributor::config_path;
use crate::node::{CoreDescriptor, LIVE_NODES_PATH, NodeConfig, NodeProcess};
use crate::topology::TOPOLOGY_PATH;
use crate::{ClusterConfig, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Namespace path holding collection state.
pub const COLLECTIONS_PATH: &str = "/collections";

/// A collection creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub num_shards: usize,
    pub replication_factor: usize,
    pub config_name: String,
}

/// Published placement of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub config_name: String,
    pub replication_factor: usize,
    pub shards: BTreeMap<String, Vec<ReplicaState>>,
}

/// Placement of one core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub core: String,
    pub node_name: String,
}

/// Handle over the running nodes of one cluster.
pub struct ClusterHandle {
    /// Namespace-scoped coordination address the nodes registered against.
    address: CoordinationAddress,

    /// Managed nodes, indexed by id.
    nodes: Vec<NodeProcess>,

    /// Bound on coordination requests and core acknowledgements.
    operation_timeout: Duration,
}

impl ClusterHandle {
    /// Publishes the topology descriptor into the namespace and boots
    /// `config.node_count` nodes under `config.data_dir`.
    ///
    /// Returns once every node is registered. On any failure the nodes that
    /// did start are stopped again before the error is returned.
    pub async fn start(coordination: &CoordinationAddress, config: &ClusterConfig) -> Result<Self> {
        let total = config.node_count;
        let deadline = Instant::now() + config.startup_timeout;
        let address = coordination.with_chroot(&config.chroot);

        prepare_namespace(&address, &config.topology, config.operation_timeout)
            .await
            .map_err(|e| Error::ClusterStartFailed {
                unready: total,
                total,
                reason: e.to_string(),
            })?;

        let mut nodes: Vec<NodeProcess> = (0..total)
            .map(|id| {
                NodeProcess::new(NodeConfig {
                    id,
                    data_dir: node_dir(&config.data_dir, id),
                })
            })
            .collect();

        let mut failures = Vec::new();
        for node in &mut nodes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match node.start(&address, remaining).await {
                Ok(()) => info!(node = node.id(), address = ?node.address(), "node started"),
                Err(e) => {
                    warn!(node = node.id(), error = %e, "node failed to start");
                    failures.push(e.to_string());
                }
            }
        }

        let mut handle = Self {
            address,
            nodes,
            operation_timeout: config.operation_timeout,
        };

        if !failures.is_empty() {
            if let Err(e) = handle.stop().await {
                warn!(error = %e, "failed to stop partially started cluster");
            }
            return Err(Error::ClusterStartFailed {
                unready: failures.len(),
                total,
                reason: failures.join("; "),
            });
        }

        info!(nodes = total, coordination = %handle.address, "cluster started");
        Ok(handle)
    }

    /// Creates a collection, placing every replica of a shard on a distinct
    /// live node, and publishes its state.
    pub async fn create_collection(&self, spec: &CollectionSpec) -> Result<CollectionState> {
        let failed = |reason: String| Error::CollectionCreateFailed {
            name: spec.name.clone(),
            reason,
        };

        if spec.name.is_empty() || spec.name.contains('/') {
            return Err(failed("invalid collection name".to_string()));
        }
        if spec.num_shards == 0 || spec.replication_factor == 0 {
            return Err(failed(format!(
                "shards ({}) and replication factor ({}) must be >= 1",
                spec.num_shards, spec.replication_factor
            )));
        }

        let mut client = CoordinationClient::connect(&self.address, self.operation_timeout)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let result = self.place(&mut client, spec).await.map_err(|e| match e {
            Error::CollectionCreateFailed { .. } => e,
            other => failed(other.to_string()),
        });
        if let Err(e) = client.close().await {
            warn!(error = %e, "failed to close coordination session");
        }
        result
    }

    async fn place(
        &self,
        client: &mut CoordinationClient,
        spec: &CollectionSpec,
    ) -> Result<CollectionState> {
        let failed = |reason: String| Error::CollectionCreateFailed {
            name: spec.name.clone(),
            reason,
        };

        if !client.exists(&config_path(&spec.config_name)).await? {
            return Err(failed(format!(
                "config set {} does not exist",
                spec.config_name
            )));
        }

        let collection_path = protocol::join(COLLECTIONS_PATH, &spec.name);
        if client.exists(&collection_path).await? {
            return Err(failed("collection already exists".to_string()));
        }

        let registered: HashSet<String> = client.children(LIVE_NODES_PATH).await?.into_iter().collect();
        let live: Vec<usize> = self
            .nodes
            .iter()
            .filter(|node| node.is_alive())
            .filter(|node| node.node_name().is_some_and(|name| registered.contains(&name)))
            .map(NodeProcess::id)
            .collect();

        if spec.replication_factor > live.len() {
            return Err(failed(format!(
                "replication factor {} exceeds {} live nodes",
                spec.replication_factor,
                live.len()
            )));
        }

        let mut placed = Vec::new();
        let shards = match self.place_cores(spec, &live, &mut placed).await {
            Ok(shards) => shards,
            Err(e) => {
                self.drop_cores(&placed).await;
                return Err(failed(e.to_string()));
            }
        };

        let state = CollectionState {
            config_name: spec.config_name.clone(),
            replication_factor: spec.replication_factor,
            shards,
        };
        let state_path = protocol::join(&collection_path, "state.json");
        let published = match serde_json::to_vec_pretty(&state) {
            Ok(data) => client.put(&state_path, &data).await.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            self.drop_cores(&placed).await;
            return Err(e);
        }

        info!(
            collection = %spec.name,
            shards = spec.num_shards,
            replication_factor = spec.replication_factor,
            "collection created"
        );
        Ok(state)
    }

    /// Asks the nodes to host every replica, recording each accepted core in
    /// `placed` as `(node id, core name)`.
    async fn place_cores(
        &self,
        spec: &CollectionSpec,
        live: &[usize],
        placed: &mut Vec<(usize, String)>,
    ) -> Result<BTreeMap<String, Vec<ReplicaState>>> {
        let mut shards = BTreeMap::new();
        let mut ordinal = 0;
        for shard_index in 0..spec.num_shards {
            let shard = format!("shard{}", shard_index + 1);
            let mut replicas = Vec::with_capacity(spec.replication_factor);
            for replica_index in 0..spec.replication_factor {
                ordinal += 1;
                let node = &self.nodes[live[(shard_index + replica_index) % live.len()]];
                let core = CoreDescriptor {
                    name: format!("{}_{shard}_replica_n{ordinal}", spec.name),
                    collection: spec.name.clone(),
                    shard: shard.clone(),
                    config_name: spec.config_name.clone(),
                };
                let core_name = core.name.clone();
                node.create_core(core, self.operation_timeout).await?;
                placed.push((node.id(), core_name.clone()));
                replicas.push(ReplicaState {
                    core: core_name,
                    node_name: node.node_name().unwrap_or_default(),
                });
            }
            shards.insert(shard, replicas);
        }
        Ok(shards)
    }

    /// Unloads cores of a collection that never got published.
    async fn drop_cores(&self, placed: &[(usize, String)]) {
        for (id, core) in placed.iter().rev() {
            let Some(node) = self.nodes.iter().find(|node| node.id() == *id) else {
                continue;
            };
            match node.drop_core(core, self.operation_timeout).await {
                Ok(()) => debug!(node = id, core = %core, "rolled back core"),
                Err(e) => warn!(node = id, core = %core, error = %e, "failed to roll back core"),
            }
        }
    }

    /// Stops every node, even when some fail. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for node in &mut self.nodes {
            match node.stop().await {
                Ok(()) => info!(node = node.id(), "node stopped"),
                Err(e) => {
                    warn!(node = node.id(), error = %e, "failed to stop node");
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::StopFailed { failures })
        }
    }

    /// Returns the namespace-scoped coordination address.
    pub fn address(&self) -> &CoordinationAddress {
        &self.address
    }
}

/// Creates the namespace root and the well-known paths, then publishes the
/// topology descriptor for nodes to read at boot.
async fn prepare_namespace(address: &CoordinationAddress, topology: &str, timeout: Duration) -> Result<()> {
    if !address.chroot().is_empty() {
        let mut root = CoordinationClient::connect(&address.root(), timeout).await?;
        root.create_all(address.chroot()).await?;
        root.close().await?;
    }

    let mut client = CoordinationClient::connect(address, timeout).await?;
    for path in [LIVE_NODES_PATH, COLLECTIONS_PATH, crate::distributor::CONFIGS_PATH] {
        client.create_all(path).await?;
    }
    client.put(TOPOLOGY_PATH, topology.as_bytes()).await?;
    client.close().await?;
    Ok(())
}

/// Reads back the published state of a collection.
pub async fn collection_state(client: &mut CoordinationClient, name: &str) -> Result<CollectionState> {
    let path = protocol::join(&protocol::join(COLLECTIONS_PATH, name), "state.json");
    let data = client.get_data(&path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Data directory of node `id` under a cluster data directory.
pub fn node_dir(data_dir: &Path, id: usize) -> PathBuf {
    data_dir.join(format!("node-{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationServer;
    use crate::topology::DEFAULT_TOPOLOGY;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(temp: &TempDir, nodes: usize) -> ClusterConfig {
        ClusterConfig::new(temp.path().join("data"), temp.path().join("conf"), nodes)
            .unwrap()
            .with_coordination_port(0)
            .with_chroot("/it")
            .with_startup_timeout(TIMEOUT)
            .with_operation_timeout(TIMEOUT)
    }

    async fn upload_empty_config(address: &CoordinationAddress, name: &str) {
        let mut client = CoordinationClient::connect(address, TIMEOUT).await.unwrap();
        client.put(&config_path(name), &[]).await.unwrap();
        client.close().await.unwrap();
    }

    fn spec(name: &str, shards: usize, replicas: usize) -> CollectionSpec {
        CollectionSpec {
            name: name.to_string(),
            num_shards: shards,
            replication_factor: replicas,
            config_name: "conf".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_stop_all() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 3);
        let mut server = CoordinationServer::start(&config.coordination_dir(), 0, TIMEOUT)
            .await
            .unwrap();

        let mut cluster = ClusterHandle::start(server.address(), &config).await.unwrap();
        assert_eq!(cluster.address().chroot(), "/it");

        let mut client = CoordinationClient::connect(cluster.address(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(client.children(LIVE_NODES_PATH).await.unwrap().len(), 3);
        assert_eq!(
            client.get_data(TOPOLOGY_PATH).await.unwrap(),
            DEFAULT_TOPOLOGY.as_bytes()
        );

        cluster.stop().await.unwrap();
        assert!(client.children(LIVE_NODES_PATH).await.unwrap().is_empty());

        // Idempotent.
        cluster.stop().await.unwrap();

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_topology_fails_all_nodes() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 2).with_topology("<solr/>");
        let mut server = CoordinationServer::start(&config.coordination_dir(), 0, TIMEOUT)
            .await
            .unwrap();

        let result = ClusterHandle::start(server.address(), &config).await;
        assert!(matches!(
            result,
            Err(Error::ClusterStartFailed {
                unready: 2,
                total: 2,
                ..
            })
        ));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_collection_places_replicas_on_distinct_nodes() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 3);
        let mut server = CoordinationServer::start(&config.coordination_dir(), 0, TIMEOUT)
            .await
            .unwrap();
        let mut cluster = ClusterHandle::start(server.address(), &config).await.unwrap();
        upload_empty_config(cluster.address(), "conf").await;

        let state = cluster.create_collection(&spec("demo", 2, 2)).await.unwrap();
        assert_eq!(state.shards.len(), 2);
        for replicas in state.shards.values() {
            assert_eq!(replicas.len(), 2);
            assert_ne!(replicas[0].node_name, replicas[1].node_name);
        }

        let mut client = CoordinationClient::connect(cluster.address(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(collection_state(&mut client, "demo").await.unwrap(), state);
        client.close().await.unwrap();

        let core_dir = node_dir(&config.data_dir, 0).join("demo_shard1_replica_n1");
        assert!(core_dir.join(crate::node::CORE_PROPERTIES).exists());

        cluster.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_collection_failures() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 1);
        let mut server = CoordinationServer::start(&config.coordination_dir(), 0, TIMEOUT)
            .await
            .unwrap();
        let mut cluster = ClusterHandle::start(server.address(), &config).await.unwrap();

        // Missing config set.
        let result = cluster.create_collection(&spec("demo", 1, 1)).await;
        assert!(matches!(result, Err(Error::CollectionCreateFailed { ref name, .. }) if name == "demo"));

        upload_empty_config(cluster.address(), "conf").await;

        // Not enough nodes for the replicas.
        let result = cluster.create_collection(&spec("wide", 1, 2)).await;
        assert!(matches!(result, Err(Error::CollectionCreateFailed { ref name, .. }) if name == "wide"));

        // Zero shards.
        let result = cluster.create_collection(&spec("empty", 0, 1)).await;
        assert!(matches!(result, Err(Error::CollectionCreateFailed { .. })));

        // Duplicate.
        cluster.create_collection(&spec("demo", 1, 1)).await.unwrap();
        let result = cluster.create_collection(&spec("demo", 1, 1)).await;
        assert!(matches!(result, Err(Error::CollectionCreateFailed { .. })));

        cluster.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_placement_releases_accepted_cores() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 1).with_topology("[node]\nmax_cores_per_node = 1\n");
        let mut server = CoordinationServer::start(&config.coordination_dir(), 0, TIMEOUT)
            .await
            .unwrap();
        let mut cluster = ClusterHandle::start(server.address(), &config).await.unwrap();
        upload_empty_config(cluster.address(), "conf").await;

        // The second shard does not fit; the first must not linger.
        let result = cluster.create_collection(&spec("big", 2, 1)).await;
        assert!(matches!(result, Err(Error::CollectionCreateFailed { ref name, .. }) if name == "big"));
        let node_0 = node_dir(&config.data_dir, 0);
        assert!(!node_0.join("big_shard1_replica_n1").exists());

        let mut client = CoordinationClient::connect(cluster.address(), TIMEOUT)
            .await
            .unwrap();
        assert!(!client.exists("/collections/big").await.unwrap());
        client.close().await.unwrap();

        // The slot is free again for another collection, and for a retry.
        cluster.create_collection(&spec("small", 1, 1)).await.unwrap();
        assert!(node_0.join("small_shard1_replica_n1").exists());

        cluster.stop().await.unwrap();
        server.stop().await.unwrap();
    }
}
