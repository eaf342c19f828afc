//! Error types for cluster lifecycle management.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::ClusterState;

/// Cluster lifecycle errors.
#[derive(Error, Debug)]
pub enum Error {
    /// `start_cluster` was called on a manager that already left `Idle`.
    #[error("Cluster already started (state: {0})")]
    AlreadyStarted(ClusterState),

    /// A steady-state operation was called while the cluster is not running.
    #[error("Cannot {operation}: cluster is {state}, expected running")]
    NotRunning {
        operation: &'static str,
        state: ClusterState,
    },

    /// The coordination service could not be started.
    #[error("Coordination service failed to start on port {port} (data dir {data_dir}): {reason}")]
    CoordinationServiceStartFailed {
        port: u16,
        data_dir: PathBuf,
        reason: String,
    },

    /// The node cluster could not be started.
    #[error("Cluster failed to start: {unready} of {total} nodes not ready: {reason}")]
    ClusterStartFailed {
        unready: usize,
        total: usize,
        reason: String,
    },

    /// The configuration set is already present in the coordination service.
    #[error("Config set {0} already exists in the coordination service")]
    ConfigAlreadyExists(String),

    /// The configuration set could not be uploaded.
    #[error("Failed to upload config set {name} from {path}: {reason}")]
    ConfigUploadFailed {
        name: String,
        path: PathBuf,
        reason: String,
    },

    /// A collection could not be created.
    #[error("Failed to create collection {name}: {reason}")]
    CollectionCreateFailed { name: String, reason: String },

    /// One or more resources failed to stop. Every stop step was attempted.
    #[error("Failed to stop cluster: {}", failures.join("; "))]
    StopFailed { failures: Vec<String> },

    /// Node already running.
    #[error("Node {0} is already running")]
    NodeAlreadyRunning(usize),

    /// Node failed to start.
    #[error("Node {0} failed to start: {1}")]
    NodeStartFailed(usize, String),

    /// Node failed to stop cleanly.
    #[error("Node {0} failed to stop: {1}")]
    NodeStopFailed(usize, String),

    /// Node task is gone.
    #[error("Node {0} crashed")]
    NodeCrashed(usize),

    /// Node did not answer in time.
    #[error("Node {0} did not respond within {1:?}")]
    NodeTimeout(usize, Duration),

    /// Node refused to host a core.
    #[error("Node {node} rejected core {core}: {reason}")]
    CoreRejected {
        node: usize,
        core: String,
        reason: String,
    },

    /// Invalid node count.
    #[error("Invalid node count: {0} (must be >= 1)")]
    InvalidNodeCount(usize),

    /// The topology descriptor could not be parsed.
    #[error("Invalid topology descriptor: {0}")]
    InvalidTopology(#[from] toml::de::Error),

    /// Coordination service client error.
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
