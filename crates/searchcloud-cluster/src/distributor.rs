//! Upload of configuration sets into the coordination service.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::coordination::{CoordinationClient, protocol};
use crate::{Error, Result};

/// Root of all configuration sets inside the namespace.
pub const CONFIGS_PATH: &str = "/configs";

/// Copies local directory trees into `/configs/<name>`.
pub struct ConfigDistributor<'a> {
    client: &'a mut CoordinationClient,
}

impl<'a> ConfigDistributor<'a> {
    /// Wraps an open coordination session.
    pub fn new(client: &'a mut CoordinationClient) -> Self {
        Self { client }
    }

    /// Returns whether a configuration set named `name` exists.
    pub async fn exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.client.exists(&config_path(name)).await?)
    }

    /// Uploads every regular file under `local_dir`, keeping relative paths.
    ///
    /// Refuses to touch an existing set. A failure part-way leaves the files
    /// written so far in place.
    pub async fn upload(&mut self, local_dir: &Path, name: &str) -> Result<usize> {
        if self.exists(name).await? {
            return Err(Error::ConfigAlreadyExists(name.to_string()));
        }

        let upload_failed = |path: &Path, reason: String| Error::ConfigUploadFailed {
            name: name.to_string(),
            path: path.to_path_buf(),
            reason,
        };

        let files = collect_files(local_dir).map_err(|e| upload_failed(local_dir, e.to_string()))?;

        let root = config_path(name);
        self.client
            .create_all(&root)
            .await
            .map_err(|e| upload_failed(local_dir, e.to_string()))?;

        for (relative, absolute) in &files {
            let content = tokio::fs::read(absolute)
                .await
                .map_err(|e| upload_failed(absolute, e.to_string()))?;
            let target = protocol::join(&root, relative);
            self.client
                .put(&target, &content)
                .await
                .map_err(|e| upload_failed(absolute, e.to_string()))?;
            debug!(file = %relative, config = name, "uploaded config file");
        }

        Ok(files.len())
    }

    /// Lists the relative paths of the files in a configuration set.
    pub async fn files(&mut self, name: &str) -> Result<Vec<String>> {
        let root = config_path(name);
        let mut files = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(relative) = pending.pop() {
            let path = if relative.is_empty() {
                root.clone()
            } else {
                protocol::join(&root, &relative)
            };
            let children = self.client.children(&path).await?;
            if children.is_empty() && !relative.is_empty() {
                files.push(relative);
                continue;
            }
            for child in children {
                pending.push(if relative.is_empty() {
                    child
                } else {
                    format!("{relative}/{child}")
                });
            }
        }

        files.sort();
        Ok(files)
    }
}

/// Path of a configuration set inside the namespace.
pub fn config_path(name: &str) -> String {
    protocol::join(CONFIGS_PATH, name)
}

/// Walks `dir` in sorted order and returns `(relative, absolute)` pairs for
/// every regular file. Relative paths always use `/`.
fn collect_files(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    walk(dir, "", &mut files)?;
    Ok(files)
}

fn walk(dir: &Path, prefix: &str, files: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &relative, files)?;
        } else if file_type.is_file() {
            files.push((relative, entry.path()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationServer;
    use std::time::Duration;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn write_conf(dir: &Path) {
        std::fs::create_dir_all(dir.join("lang")).unwrap();
        std::fs::write(dir.join("solrconfig.xml"), "<config/>").unwrap();
        std::fs::write(dir.join("managed-schema"), "<schema/>").unwrap();
        std::fs::write(dir.join("lang").join("stopwords_en.txt"), "a\nthe\n").unwrap();
    }

    #[test]
    fn test_collect_files_sorted_and_relative() {
        let temp = TempDir::new().unwrap();
        write_conf(temp.path());

        let files: Vec<String> = collect_files(temp.path())
            .unwrap()
            .into_iter()
            .map(|(relative, _)| relative)
            .collect();
        assert_eq!(
            files,
            vec!["lang/stopwords_en.txt", "managed-schema", "solrconfig.xml"]
        );
    }

    #[tokio::test]
    async fn test_upload_then_reject_duplicate() {
        let temp = TempDir::new().unwrap();
        let conf = temp.path().join("conf");
        write_conf(&conf);

        let mut server = CoordinationServer::start(&temp.path().join("zk"), 0, TIMEOUT)
            .await
            .unwrap();
        let mut client = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();

        let mut distributor = ConfigDistributor::new(&mut client);
        assert!(!distributor.exists("demo").await.unwrap());
        assert_eq!(distributor.upload(&conf, "demo").await.unwrap(), 3);
        assert!(distributor.exists("demo").await.unwrap());

        std::fs::write(conf.join("solrconfig.xml"), "<changed/>").unwrap();
        let result = distributor.upload(&conf, "demo").await;
        assert!(matches!(result, Err(Error::ConfigAlreadyExists(name)) if name == "demo"));

        assert_eq!(
            distributor.files("demo").await.unwrap(),
            vec!["lang/stopwords_en.txt", "managed-schema", "solrconfig.xml"]
        );
        assert_eq!(
            client.get_data("/configs/demo/solrconfig.xml").await.unwrap(),
            b"<config/>"
        );

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_missing_dir_fails() {
        let temp = TempDir::new().unwrap();
        let mut server = CoordinationServer::start(&temp.path().join("zk"), 0, TIMEOUT)
            .await
            .unwrap();
        let mut client = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();

        let mut distributor = ConfigDistributor::new(&mut client);
        let result = distributor.upload(&temp.path().join("absent"), "demo").await;
        assert!(matches!(result, Err(Error::ConfigUploadFailed { .. })));
        assert!(!distributor.exists("demo").await.unwrap());

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }
}
