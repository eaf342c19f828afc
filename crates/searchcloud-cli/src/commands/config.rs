//! Shows the resolved driver configuration.

use anyhow::{Context, Result};
use searchcloud_config::ConfigLoader;
use std::path::Path;

/// Prints the merged configuration as TOML.
pub fn show(project: &Path) -> Result<()> {
    let config = ConfigLoader::new()
        .with_project_dir(project)
        .load()
        .context("Failed to load configuration")?;

    print!("{}", config.to_toml()?);
    Ok(())
}
