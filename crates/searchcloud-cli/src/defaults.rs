//! Default configuration set, compiled into the binary.

use std::path::Path;

use anyhow::{Context, Result};
use searchcloud_cluster::ownership::is_absent_or_empty;
use tracing::{debug, info};

/// Relative path and content of every file in the default set.
pub const DEFAULT_CONF: &[(&str, &str)] = &[
    ("_rest_managed.json", include_str!("../conf/_rest_managed.json")),
    ("currency.xml", include_str!("../conf/currency.xml")),
    ("managed-schema", include_str!("../conf/managed-schema")),
    ("protwords.txt", include_str!("../conf/protwords.txt")),
    ("solrconfig.xml", include_str!("../conf/solrconfig.xml")),
    ("stopwords.txt", include_str!("../conf/stopwords.txt")),
    ("synonyms.txt", include_str!("../conf/synonyms.txt")),
    ("lang/stopwords_en.txt", include_str!("../conf/lang/stopwords_en.txt")),
];

/// What [`materialize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The default set was written; holds the file count.
    Written(usize),

    /// The directory already had content, which was left as is.
    Kept,
}

/// Writes the default set into `dir` if it is absent or empty.
pub fn materialize(dir: &Path) -> Result<Materialized> {
    if !is_absent_or_empty(dir) {
        info!(dir = %dir.display(), "conf dir already has content; not writing defaults");
        return Ok(Materialized::Kept);
    }

    for (relative, content) in DEFAULT_CONF {
        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, content)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        debug!(file = relative, "wrote default conf file");
    }

    Ok(Materialized::Written(DEFAULT_CONF.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_into_absent_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("conf");

        assert_eq!(materialize(&dir).unwrap(), Materialized::Written(8));
        assert!(dir.join("solrconfig.xml").is_file());
        assert!(dir.join("lang").join("stopwords_en.txt").is_file());

        let schema = std::fs::read_to_string(dir.join("managed-schema")).unwrap();
        assert!(schema.contains("<uniqueKey>id</uniqueKey>"));
    }

    #[test]
    fn test_writes_into_empty_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(materialize(temp.path()).unwrap(), Materialized::Written(8));
    }

    #[test]
    fn test_keeps_existing_content() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("solrconfig.xml"), "<mine/>").unwrap();

        assert_eq!(materialize(temp.path()).unwrap(), Materialized::Kept);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("solrconfig.xml")).unwrap(),
            "<mine/>"
        );
        assert!(!temp.path().join("managed-schema").exists());
    }
}
