//! Runs an ephemeral cluster for the duration of a test session.
//!
//! Start, upload the configuration set, create collections, wait for Ctrl+C,
//! then stop and clean up the directories this run created.

use anyhow::{Context, Result};
use clap::Args;
use searchcloud_cluster::{
    CleanOutcome, ClusterConfig, ClusterLifecycleManager, DEFAULT_TOPOLOGY,
};
use searchcloud_config::{ConfigLoader, Paths, SearchCloudConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::defaults::{self, Materialized};
use crate::style::{self, colors::SemanticStyle};

/// Command-line overrides for `searchcloud run`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Number of nodes.
    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Coordination service port (0 picks a free one).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Isolation namespace inside the coordination service.
    #[arg(long)]
    pub chroot: Option<String>,

    /// Cluster data directory (default: fresh temp dir under target/searchcloud).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the configuration set to upload.
    #[arg(long)]
    pub conf_dir: Option<PathBuf>,

    /// Collection to create; repeat for several. Replaces the configured list.
    #[arg(short, long = "collection")]
    pub collections: Vec<String>,

    /// Do not upload the configuration set.
    #[arg(long)]
    pub no_upload: bool,

    /// Do not create collections.
    #[arg(long)]
    pub no_collections: bool,

    /// Keep the data directory after stopping.
    #[arg(long)]
    pub keep_data: bool,

    /// Keep the config directory after stopping.
    #[arg(long)]
    pub keep_conf: bool,

    /// Do nothing.
    #[arg(long)]
    pub skip: bool,

    /// Stop right after setup instead of waiting for Ctrl+C.
    #[arg(long)]
    pub once: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut SearchCloudConfig, project: &Path) {
        config.skip |= self.skip;
        if let Some(nodes) = self.nodes {
            config.cluster.nodes = nodes;
        }
        if let Some(port) = self.port {
            config.coordination.port = port;
        }
        if let Some(chroot) = &self.chroot {
            config.coordination.chroot.clone_from(chroot);
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(project.join(dir));
        }
        if let Some(dir) = &self.conf_dir {
            config.config_set.dir = project.join(dir);
        }
        if !self.collections.is_empty() {
            config.collections.names.clone_from(&self.collections);
        }
        config.config_set.upload &= !self.no_upload;
        config.collections.create &= !self.no_collections;
        config.cleanup.data_dir &= !self.keep_data;
        config.cleanup.conf_dir &= !self.keep_conf;
    }
}

pub async fn run(project: &Path, args: &RunArgs) -> Result<()> {
    let mut config = ConfigLoader::new()
        .with_project_dir(project)
        .load()
        .context("Failed to load configuration")?;
    args.apply(&mut config, project);
    config.validate()?;

    if config.skip {
        info!("skip is set; not starting a cluster");
        return Ok(());
    }

    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => fresh_data_dir(project)?,
    };
    let topology = config
        .topology()?
        .unwrap_or_else(|| DEFAULT_TOPOLOGY.to_string());

    let cluster_config = ClusterConfig::new(
        data_dir,
        config.config_set.dir.clone(),
        config.cluster.nodes,
    )?
    .with_coordination_port(config.coordination.port)
    .with_chroot(config.coordination.chroot.clone())
    .with_topology(topology)
    .with_config_name(config.config_set.name.clone())
    .with_startup_timeout(config.timeouts.startup())
    .with_operation_timeout(config.timeouts.operation());

    // Ownership is fixed here, before any default conf is written.
    let manager = ClusterLifecycleManager::new(cluster_config)?;

    let setup = set_up(&manager, &config).await;
    if setup.is_ok() {
        if let Some(address) = manager.coordination_address().await {
            println!();
            style::print_labeled("Coordination", &address.to_string());
            style::print_labeled("Data dir", &manager.data_dir().display().to_string());
            println!();
        }

        if args.once {
            info!("setup done; stopping");
        } else {
            println!("Cluster running. Press {} to stop.", "Ctrl+C".code());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
        }
    }

    let stopped = manager.stop_cluster().await;
    match &stopped {
        Ok(()) => style::print_success("Cluster stopped"),
        Err(e) => style::print_error(&format!("Cluster did not stop cleanly: {e}")),
    }

    if config.cleanup.data_dir {
        report_clean("data", manager.clean_data_dir().await);
    }
    if config.cleanup.conf_dir {
        report_clean("conf", manager.clean_conf_dir().await);
    }

    setup?;
    stopped?;
    Ok(())
}

/// Start phase: cluster, config set, collections.
async fn set_up(manager: &ClusterLifecycleManager, config: &SearchCloudConfig) -> Result<()> {
    let spinner = style::create_spinner(&format!(
        "Starting {}-node cluster...",
        config.cluster.nodes
    ));
    if let Err(e) = manager.start_cluster().await {
        style::finish_error(&spinner, "Cluster failed to start");
        return Err(e).context("Failed to start cluster");
    }
    style::finish_success(
        &spinner,
        &format!("{} nodes started", config.cluster.nodes),
    );

    if config.config_set.upload {
        if let Materialized::Written(count) = defaults::materialize(manager.conf_dir())? {
            info!(files = count, dir = %manager.conf_dir().display(), "wrote default conf set");
        }
        let files = manager
            .upload_config()
            .await
            .context("Failed to upload configuration set")?;
        style::print_success(&format!(
            "Uploaded config set {} ({files} files)",
            config.config_set.name.code()
        ));
    }

    if config.collections.create {
        for name in &config.collections.names {
            manager
                .create_collection(name, config.collections.shards, config.collections.replicas)
                .await
                .with_context(|| format!("Failed to create collection {name}"))?;
            style::print_success(&format!("Created collection {}", name.code()));
        }
    }

    Ok(())
}

/// A new, empty directory under `target/searchcloud` for this run only.
fn fresh_data_dir(project: &Path) -> Result<PathBuf> {
    let parent = Paths::work_dir(project);
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let dir = tempfile::Builder::new()
        .prefix("temp")
        .tempdir_in(&parent)
        .with_context(|| format!("Failed to create temp dir in {}", parent.display()))?;
    Ok(dir.keep())
}

fn report_clean(kind: &str, outcome: CleanOutcome) {
    match outcome {
        CleanOutcome::Removed => info!("{kind} dir removed"),
        CleanOutcome::Absent => info!("{kind} dir already gone"),
        CleanOutcome::NotOwned => {
            style::print_warn(&format!("{kind} dir held existing content; kept"));
        }
        CleanOutcome::Failed(reason) => warn!(%reason, "{kind} dir could not be removed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let mut config = SearchCloudConfig::default();
        let args = RunArgs {
            nodes: Some(3),
            port: Some(0),
            data_dir: Some(PathBuf::from("it-data")),
            collections: vec!["books".to_string()],
            no_upload: true,
            keep_conf: true,
            ..RunArgs::default()
        };
        args.apply(&mut config, Path::new("/work"));

        assert_eq!(config.cluster.nodes, 3);
        assert_eq!(config.coordination.port, 0);
        assert_eq!(config.data_dir, Some(PathBuf::from("/work/it-data")));
        assert_eq!(config.collections.names, vec!["books".to_string()]);
        assert!(!config.config_set.upload);
        assert!(config.collections.create);
        assert!(config.cleanup.data_dir);
        assert!(!config.cleanup.conf_dir);
    }

    #[test]
    fn test_fresh_data_dir_is_empty_and_unique() {
        let temp = tempfile::TempDir::new().unwrap();
        let first = fresh_data_dir(temp.path()).unwrap();
        let second = fresh_data_dir(temp.path()).unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with(temp.path().join("target/searchcloud")));
        assert_eq!(std::fs::read_dir(&first).unwrap().count(), 0);
    }
}
