//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = "searchcloud.toml";

/// Local override file name, usually gitignored.
pub const LOCAL_CONFIG_FILE: &str = "searchcloud.local.toml";

/// XDG-compliant paths for searchcloud
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "searchcloud", "searchcloud"),
        }
    }

    /// Get user config directory (~/.config/searchcloud/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| ConfigError::Xdg("Failed to determine user config directory".to_string()))
    }

    /// Get user config file path (~/.config/searchcloud/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(PROJECT_CONFIG_FILE)
    }

    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(LOCAL_CONFIG_FILE)
    }

    /// Build output directory that holds generated data and conf dirs.
    pub fn work_dir(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("target").join("searchcloud")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
