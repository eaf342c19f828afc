//! Tracking of which directories this manager may delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Records, per directory, whether it was absent or empty when first seen.
///
/// Only such directories are considered created by us and therefore safe to
/// delete. A flag never goes from owned back to not owned.
#[derive(Debug, Clone, Default)]
pub struct DirectoryOwnershipTracker {
    owned: HashMap<PathBuf, bool>,
}

impl DirectoryOwnershipTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspects `path` and records ownership. Returns the recorded flag.
    ///
    /// A path that is already owned stays owned.
    pub fn mark_owned_if_absent_or_empty(&mut self, path: &Path) -> bool {
        let owned = is_absent_or_empty(path);
        let flag = self.owned.entry(path.to_path_buf()).or_insert(false);
        *flag |= owned;
        *flag
    }

    /// Returns whether cleanup may delete `path`.
    pub fn is_owned(&self, path: &Path) -> bool {
        self.owned.get(path).copied().unwrap_or(false)
    }
}

/// Whether `path` does not exist or is a directory with no entries.
///
/// Anything unreadable, or a non-directory, counts as caller-owned.
pub fn is_absent_or_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}
