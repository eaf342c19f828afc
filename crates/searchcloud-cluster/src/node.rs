//! Worker node management.

use crate::coordination::{CoordinationAddress, CoordinationClient, protocol};
use crate::topology::{TOPOLOGY_PATH, Topology};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Namespace path under which nodes register themselves.
pub const LIVE_NODES_PATH: &str = "/live_nodes";

/// File written into every core directory.
pub const CORE_PROPERTIES: &str = "core.properties";

/// How long a node gets to deregister and exit when asked to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Node is stopped.
    Stopped,

    /// Node is starting up.
    Starting,

    /// Node is running normally.
    Running,

    /// Node has crashed.
    Crashed,
}

/// Configuration for a single node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node ID (0-indexed).
    pub id: usize,

    /// Directory holding this node's cores.
    pub data_dir: PathBuf,
}

/// One replica of one shard of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreDescriptor {
    pub name: String,
    pub collection: String,
    pub shard: String,
    pub config_name: String,
}

impl CoreDescriptor {
    fn properties(&self) -> String {
        format!(
            "name={}\ncollection={}\nshard={}\nconfigSet={}\n",
            self.name, self.collection, self.shard, self.config_name
        )
    }
}

enum NodeCommand {
    CreateCore {
        core: CoreDescriptor,
        ack: oneshot::Sender<Result<PathBuf>>,
    },
    DropCore {
        name: String,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// A managed node running as a task on the current runtime.
pub struct NodeProcess {
    /// Node configuration.
    pub config: NodeConfig,

    /// Current status.
    pub status: NodeStatus,

    address: Option<SocketAddr>,
    commands: Option<mpsc::Sender<NodeCommand>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl NodeProcess {
    /// Creates a new node (not started).
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            status: NodeStatus::Stopped,
            address: None,
            commands: None,
            shutdown: None,
            task: None,
        }
    }

    /// Starts the node and waits until it has registered with the
    /// coordination service at `coordination`.
    pub async fn start(&mut self, coordination: &CoordinationAddress, timeout: Duration) -> Result<()> {
        if self.status != NodeStatus::Stopped && self.status != NodeStatus::Crashed {
            return Err(Error::NodeAlreadyRunning(self.config.id));
        }

        self.status = NodeStatus::Starting;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_node(
            self.config.clone(),
            coordination.clone(),
            timeout,
            ready_tx,
            command_rx,
            shutdown_rx,
        ));

        let outcome = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(address))) => Ok(address),
            Ok(Ok(Err(reason))) => Err(reason),
            Ok(Err(_)) => Err("node exited before reporting ready".to_string()),
            Err(_) => Err(format!("not ready after {timeout:?}")),
        };

        match outcome {
            Ok(address) => {
                self.address = Some(address);
                self.commands = Some(command_tx);
                self.shutdown = Some(shutdown_tx);
                self.task = Some(task);
                self.status = NodeStatus::Running;
                Ok(())
            }
            Err(reason) => {
                task.abort();
                self.status = NodeStatus::Crashed;
                Err(Error::NodeStartFailed(self.config.id, reason))
            }
        }
    }

    /// Stops the node, deregistering it from the coordination service.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(()); // Already stopped
        };
        self.commands = None;
        self.address = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        let outcome = tokio::time::timeout(STOP_TIMEOUT, &mut task).await;
        self.status = NodeStatus::Stopped;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::NodeStopFailed(self.config.id, e.to_string())),
            Err(_) => {
                task.abort();
                Err(Error::NodeStopFailed(
                    self.config.id,
                    format!("did not exit within {STOP_TIMEOUT:?}"),
                ))
            }
        }
    }

    /// Asks the node to host a core and waits for its acknowledgement.
    pub async fn create_core(&self, core: CoreDescriptor, timeout: Duration) -> Result<PathBuf> {
        let id = self.config.id;
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::NodeStartFailed(id, "node is not running".to_string()))?;

        let (ack, ack_rx) = oneshot::channel();
        commands
            .send(NodeCommand::CreateCore { core, ack })
            .await
            .map_err(|_| Error::NodeCrashed(id))?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NodeCrashed(id)),
            Err(_) => Err(Error::NodeTimeout(id, timeout)),
        }
    }

    /// Asks the node to unload a core and delete its directory. Unknown
    /// cores are ignored.
    pub async fn drop_core(&self, name: &str, timeout: Duration) -> Result<()> {
        let id = self.config.id;
        let commands = self
            .commands
            .as_ref()
            .ok_or(Error::NodeCrashed(id))?;

        let (ack, ack_rx) = oneshot::channel();
        commands
            .send(NodeCommand::DropCore {
                name: name.to_string(),
                ack,
            })
            .await
            .map_err(|_| Error::NodeCrashed(id))?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NodeCrashed(id)),
            Err(_) => Err(Error::NodeTimeout(id, timeout)),
        }
    }

    /// Checks if the node task is alive.
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Returns the node ID.
    pub fn id(&self) -> usize {
        self.config.id
    }

    /// Returns the dynamically allocated address, while running.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Returns the name the node registered under, while running.
    pub fn node_name(&self) -> Option<String> {
        self.address.map(node_name)
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Name under [`LIVE_NODES_PATH`] for a node listening on `address`.
pub fn node_name(address: SocketAddr) -> String {
    format!("{address}_node")
}

struct BootedNode {
    client: CoordinationClient,
    listener: TcpListener,
    topology: Topology,
    registration: String,
}

async fn boot(config: &NodeConfig, coordination: &CoordinationAddress, timeout: Duration) -> Result<BootedNode> {
    let mut client = CoordinationClient::connect(coordination, timeout).await?;

    let descriptor = client.get_data(TOPOLOGY_PATH).await?;
    let topology = Topology::parse(&String::from_utf8_lossy(&descriptor))?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let listener = TcpListener::bind((topology.node.host.as_str(), 0)).await?;
    let address = listener.local_addr()?;

    let registration = protocol::join(LIVE_NODES_PATH, &node_name(address));
    let data = config.data_dir.to_string_lossy().into_owned();
    client.create_ephemeral(&registration, data.as_bytes()).await?;

    Ok(BootedNode {
        client,
        listener,
        topology,
        registration,
    })
}

async fn run_node(
    config: NodeConfig,
    coordination: CoordinationAddress,
    timeout: Duration,
    ready: oneshot::Sender<std::result::Result<SocketAddr, String>>,
    mut commands: mpsc::Receiver<NodeCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let booted = match boot(&config, &coordination, timeout).await {
        Ok(booted) => booted,
        Err(e) => {
            warn!(node = config.id, error = %e, "node failed to boot");
            let _ = ready.send(Err(e.to_string()));
            return Err(e);
        }
    };
    let BootedNode {
        mut client,
        listener,
        topology,
        registration,
    } = booted;

    let address = listener.local_addr()?;
    info!(node = config.id, %address, "node registered");
    let _ = ready.send(Ok(address));

    let mut cores: BTreeMap<String, PathBuf> = BTreeMap::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                Some(NodeCommand::CreateCore { core, ack }) => {
                    let result = create_core(&config, &topology, &mut cores, &core).await;
                    let _ = ack.send(result);
                }
                Some(NodeCommand::DropCore { name, ack }) => {
                    let result = drop_core(&config, &mut cores, &name).await;
                    let _ = ack.send(result);
                }
                None => break,
            },
            accepted = listener.accept() => {
                // Health probe: answer and hang up.
                if let Ok((mut stream, peer)) = accepted {
                    debug!(node = config.id, %peer, "health probe");
                    let _ = stream.write_all(b"OK\n").await;
                }
            }
        }
    }

    drop(listener);
    client.delete(&registration).await?;
    client.close().await?;
    info!(node = config.id, cores = cores.len(), "node stopped");
    Ok(())
}

async fn create_core(
    config: &NodeConfig,
    topology: &Topology,
    cores: &mut BTreeMap<String, PathBuf>,
    core: &CoreDescriptor,
) -> Result<PathBuf> {
    let limit = topology.node.max_cores_per_node;
    if cores.len() >= limit {
        return Err(Error::CoreRejected {
            node: config.id,
            core: core.name.clone(),
            reason: format!("node already hosts {} cores (max {limit})", cores.len()),
        });
    }
    if cores.contains_key(&core.name) {
        return Err(Error::CoreRejected {
            node: config.id,
            core: core.name.clone(),
            reason: "core already exists".to_string(),
        });
    }

    let dir = config.data_dir.join(&core.name);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(CORE_PROPERTIES), core.properties()).await?;

    debug!(node = config.id, core = %core.name, "core created");
    cores.insert(core.name.clone(), dir.clone());
    Ok(dir)
}

async fn drop_core(config: &NodeConfig, cores: &mut BTreeMap<String, PathBuf>, name: &str) -> Result<()> {
    let Some(dir) = cores.remove(name) else {
        return Ok(());
    };
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    debug!(node = config.id, core = %name, "core dropped");
    Ok(())
}
