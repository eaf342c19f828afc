//! Cluster lifecycle manager: the single sequencer and safety gate for a
//! cluster's life.
//!
//! ```text
//! Idle --start_cluster(ok)--> Running --stop_cluster--> Stopped
//!  ^          |
//!  +-(failed)-+
//! ```
//!
//! A manager is single-use: once stopped it never runs again. Every public
//! operation takes the same lock, so a stop issued from a shutdown hook
//! cannot interleave with a start still in flight.

use std::fmt;
use std::path::Path;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHandle, CollectionSpec, CollectionState};
use crate::coordination::{CoordinationAddress, CoordinationClient, CoordinationServer};
use crate::distributor::ConfigDistributor;
use crate::ownership::DirectoryOwnershipTracker;
use crate::{ClusterConfig, Error, Result};

/// Lifecycle state of a managed cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Constructed, nothing running.
    Idle,

    /// Coordination service and all nodes are up.
    Running,

    /// Torn down. Terminal.
    Stopped,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// Result of a directory cleanup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The directory tree was deleted.
    Removed,

    /// Nothing to delete.
    Absent,

    /// The directory held caller data when the manager was built; left alone.
    NotOwned,

    /// Deletion failed; the reason was logged as a warning.
    Failed(String),
}

struct Inner {
    state: ClusterState,
    coordination: Option<CoordinationServer>,
    cluster: Option<ClusterHandle>,
}

/// Owns one ephemeral cluster from start to cleanup.
pub struct ClusterLifecycleManager {
    config: ClusterConfig,
    ownership: DirectoryOwnershipTracker,
    inner: Mutex<Inner>,
}

impl ClusterLifecycleManager {
    /// Creates a manager. Directory ownership is decided here, once: a
    /// directory is ours to delete only if it is absent or empty right now.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        if config.node_count == 0 {
            return Err(Error::InvalidNodeCount(config.node_count));
        }

        let mut ownership = DirectoryOwnershipTracker::new();
        let data_owned = ownership.mark_owned_if_absent_or_empty(&config.data_dir);
        let conf_owned = ownership.mark_owned_if_absent_or_empty(&config.conf_dir);
        debug!(
            data_dir = %config.data_dir.display(),
            data_owned,
            conf_dir = %config.conf_dir.display(),
            conf_owned,
            "directory ownership recorded"
        );

        Ok(Self {
            config,
            ownership,
            inner: Mutex::new(Inner {
                state: ClusterState::Idle,
                coordination: None,
                cluster: None,
            }),
        })
    }

    /// Returns the cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> ClusterState {
        self.inner.lock().await.state
    }

    /// Returns the namespace-scoped coordination address while running.
    pub async fn coordination_address(&self) -> Option<CoordinationAddress> {
        let inner = self.inner.lock().await;
        inner
            .coordination
            .as_ref()
            .map(|server| server.address().with_chroot(&self.config.chroot))
    }

    /// Whether cleanup may delete the data directory.
    pub fn owns_data_dir(&self) -> bool {
        self.ownership.is_owned(&self.config.data_dir)
    }

    /// Whether cleanup may delete the config directory.
    pub fn owns_conf_dir(&self) -> bool {
        self.ownership.is_owned(&self.config.conf_dir)
    }

    /// Starts the coordination service, then the nodes.
    ///
    /// If the nodes fail to come up, the coordination service is stopped
    /// before the error is returned and the manager stays `Idle`.
    pub async fn start_cluster(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ClusterState::Idle {
            return Err(Error::AlreadyStarted(inner.state));
        }

        info!(
            nodes = self.config.node_count,
            port = self.config.coordination_port,
            data_dir = %self.config.data_dir.display(),
            "starting cluster"
        );

        let coordination_dir = self.config.coordination_dir();
        let coordination_failed = |reason: String| Error::CoordinationServiceStartFailed {
            port: self.config.coordination_port,
            data_dir: coordination_dir.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|e| coordination_failed(e.to_string()))?;

        let mut coordination = CoordinationServer::start(
            &coordination_dir,
            self.config.coordination_port,
            self.config.startup_timeout,
        )
        .await
        .map_err(|e| coordination_failed(e.to_string()))?;

        let cluster = match ClusterHandle::start(coordination.address(), &self.config).await {
            Ok(cluster) => cluster,
            Err(e) => {
                if let Err(stop_err) = coordination.stop().await {
                    warn!(error = %stop_err, "failed to stop coordination service during rollback");
                }
                return Err(match e {
                    Error::ClusterStartFailed { .. } => e,
                    other => Error::ClusterStartFailed {
                        unready: self.config.node_count,
                        total: self.config.node_count,
                        reason: other.to_string(),
                    },
                });
            }
        };

        inner.coordination = Some(coordination);
        inner.cluster = Some(cluster);
        inner.state = ClusterState::Running;

        info!("cluster running");
        Ok(())
    }

    /// Uploads the config directory as the configured configuration set.
    ///
    /// Never overwrites an existing set. Failures leave the cluster running.
    pub async fn upload_config(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        let coordination = running(&inner, "upload config")?
            .coordination
            .as_ref()
            .map(|server| server.address().with_chroot(&self.config.chroot))
            .ok_or(Error::NotRunning {
                operation: "upload config",
                state: inner.state,
            })?;

        let name = &self.config.config_name;
        let conf_dir = &self.config.conf_dir;
        let mut client = CoordinationClient::connect(&coordination, self.config.operation_timeout)
            .await
            .map_err(|e| Error::ConfigUploadFailed {
                name: name.clone(),
                path: conf_dir.clone(),
                reason: e.to_string(),
            })?;

        debug!(config = %name, conf_dir = %conf_dir.display(), "uploading config set");
        let uploaded = ConfigDistributor::new(&mut client)
            .upload(conf_dir, name)
            .await
            .map_err(|e| match e {
                Error::ConfigAlreadyExists(_) | Error::ConfigUploadFailed { .. } => e,
                other => Error::ConfigUploadFailed {
                    name: name.clone(),
                    path: conf_dir.clone(),
                    reason: other.to_string(),
                },
            });

        if let Err(e) = client.close().await {
            warn!(error = %e, "failed to close coordination session");
        }

        let uploaded = uploaded?;
        info!(config = %name, files = uploaded, "config set uploaded");
        Ok(uploaded)
    }

    /// Creates a collection backed by the configured configuration set.
    pub async fn create_collection(
        &self,
        name: &str,
        num_shards: usize,
        replication_factor: usize,
    ) -> Result<CollectionState> {
        let inner = self.inner.lock().await;
        let cluster = running(&inner, "create collection")?
            .cluster
            .as_ref()
            .ok_or(Error::NotRunning {
                operation: "create collection",
                state: inner.state,
            })?;

        let spec = CollectionSpec {
            name: name.to_string(),
            num_shards,
            replication_factor,
            config_name: self.config.config_name.clone(),
        };
        cluster.create_collection(&spec).await
    }

    /// Stops the nodes, then the coordination service. Idempotent.
    ///
    /// Both steps always run. Their failures come back as one
    /// [`Error::StopFailed`], and the state is `Stopped` either way.
    pub async fn stop_cluster(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ClusterState::Stopped => return Ok(()),
            ClusterState::Idle => {
                debug!("stop requested before start; nothing to stop");
                inner.state = ClusterState::Stopped;
                return Ok(());
            }
            ClusterState::Running => {}
        }

        info!("stopping cluster");
        let mut failures = Vec::new();

        if let Some(mut cluster) = inner.cluster.take() {
            if let Err(e) = cluster.stop().await {
                warn!(error = %e, "node cluster did not stop cleanly");
                match e {
                    Error::StopFailed { failures: nodes } => failures.extend(nodes),
                    other => failures.push(other.to_string()),
                }
            }
        }

        if let Some(mut coordination) = inner.coordination.take() {
            if let Err(e) = coordination.stop().await {
                warn!(error = %e, "coordination service did not stop cleanly");
                failures.push(format!("coordination service: {e}"));
            }
        }

        inner.state = ClusterState::Stopped;

        if failures.is_empty() {
            info!("cluster stopped");
            Ok(())
        } else {
            Err(Error::StopFailed { failures })
        }
    }

    /// Deletes the data directory if this manager owns it.
    pub async fn clean_data_dir(&self) -> CleanOutcome {
        let _inner = self.lock_for_clean().await;
        self.clean(&self.config.data_dir, "data").await
    }

    /// Deletes the config directory if this manager owns it.
    pub async fn clean_conf_dir(&self) -> CleanOutcome {
        let _inner = self.lock_for_clean().await;
        self.clean(&self.config.conf_dir, "conf").await
    }

    async fn lock_for_clean(&self) -> tokio::sync::MutexGuard<'_, Inner> {
        let inner = self.inner.lock().await;
        if inner.state == ClusterState::Running {
            warn!("cleaning a directory while the cluster is still running");
        }
        inner
    }

    async fn clean(&self, dir: &Path, kind: &str) -> CleanOutcome {
        if !self.ownership.is_owned(dir) {
            warn!(
                dir = %dir.display(),
                "can't delete {kind} dir: content was already there before the cluster started"
            );
            return CleanOutcome::NotOwned;
        }

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(dir = %dir.display(), "{kind} dir deleted");
                CleanOutcome::Removed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CleanOutcome::Absent,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "error while cleaning {kind} dir");
                CleanOutcome::Failed(e.to_string())
            }
        }
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the config directory path.
    pub fn conf_dir(&self) -> &Path {
        &self.config.conf_dir
    }
}

fn running<'a>(inner: &'a Inner, operation: &'static str) -> Result<&'a Inner> {
    if inner.state == ClusterState::Running {
        Ok(inner)
    } else {
        Err(Error::NotRunning {
            operation,
            state: inner.state,
        })
    }
}
