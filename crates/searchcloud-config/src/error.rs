//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read topology file at {path}: {source}")]
    TopologyRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to render configuration as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("XDG directory error: {0}")]
    Xdg(String),
}
