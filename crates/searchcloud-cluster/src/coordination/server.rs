//! Coordination service process: listener, sessions and the path tree.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::protocol::{self, ErrorCode, Request, Response};
use super::{CoordinationAddress, CoordinationClient, CoordinationError};

/// File holding persistent entries across restarts of the same data dir.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

type SessionId = u64;
type SharedTree = Arc<Mutex<Tree>>;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

/// In-memory path tree. The root `/` always exists.
#[derive(Debug)]
struct Tree {
    entries: BTreeMap<String, Entry>,
}

impl Tree {
    fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                data: Vec::new(),
                owner: None,
            },
        );
        Self { entries }
    }

    fn restore(snapshot: BTreeMap<String, Vec<u8>>) -> Self {
        let mut tree = Self::new();
        for (path, data) in snapshot {
            if protocol::is_valid_path(&path) {
                tree.entries.insert(path, Entry { data, owner: None });
            }
        }
        tree
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries
            .iter()
            .filter(|(path, entry)| entry.owner.is_none() && path.as_str() != "/")
            .map(|(path, entry)| (path.clone(), entry.data.clone()))
            .collect()
    }

    fn apply(&mut self, request: Request, session: SessionId) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::Exists { path } => match check(&path) {
                Some(error) => error,
                None => Response::Exists {
                    exists: self.entries.contains_key(&path),
                },
            },
            Request::Create {
                path,
                data,
                ephemeral,
            } => {
                if let Some(error) = check(&path) {
                    return error;
                }
                if self.entries.contains_key(&path) {
                    return error(ErrorCode::NodeExists, path);
                }
                let parent_exists = protocol::parent(&path)
                    .is_some_and(|parent| self.entries.contains_key(parent));
                if !parent_exists {
                    return error(ErrorCode::NoNode, path);
                }
                let owner = ephemeral.then_some(session);
                self.entries.insert(path, Entry { data, owner });
                Response::Ok
            }
            Request::SetData { path, data } => match self.entries.get_mut(&path) {
                Some(entry) => {
                    entry.data = data;
                    Response::Ok
                }
                None => error(ErrorCode::NoNode, path),
            },
            Request::GetData { path } => match self.entries.get(&path) {
                Some(entry) => Response::Data {
                    data: entry.data.clone(),
                },
                None => error(ErrorCode::NoNode, path),
            },
            Request::Children { path } => {
                if !self.entries.contains_key(&path) {
                    return error(ErrorCode::NoNode, path);
                }
                Response::Children {
                    children: self.children(&path).map(str::to_string).collect(),
                }
            }
            Request::Delete { path } => {
                if path == "/" {
                    return error(ErrorCode::BadPath, path);
                }
                if !self.entries.contains_key(&path) {
                    return error(ErrorCode::NoNode, path);
                }
                if self.children(&path).next().is_some() {
                    return error(ErrorCode::NotEmpty, path);
                }
                self.entries.remove(&path);
                Response::Ok
            }
        }
    }

    fn children<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let skip = prefix.len();
        self.entries
            .range(prefix.clone()..)
            .map(|(key, _)| key.as_str())
            .take_while(move |key| key.starts_with(prefix.as_str()))
            .filter_map(move |key| {
                let rest = &key[skip..];
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
    }

    fn expire_session(&mut self, session: SessionId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.owner != Some(session));
        before - self.entries.len()
    }
}

fn check(path: &str) -> Option<Response> {
    (!protocol::is_valid_path(path)).then(|| error(ErrorCode::BadPath, path.to_string()))
}

fn error(code: ErrorCode, path: String) -> Response {
    Response::Error { code, path }
}

/// A running coordination service bound to a loopback port.
pub struct CoordinationServer {
    address: CoordinationAddress,
    data_dir: PathBuf,
    tree: SharedTree,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl CoordinationServer {
    /// Starts the service on `port` (0 picks an ephemeral port) with its
    /// state rooted in `data_dir`.
    ///
    /// Returns once a client ping round-trips, or fails after `timeout`.
    pub async fn start(
        data_dir: &Path,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let tree = Arc::new(Mutex::new(load_snapshot(data_dir).await?));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let socket = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, tree.clone(), shutdown_rx));

        let mut server = Self {
            address: CoordinationAddress::new(socket),
            data_dir: data_dir.to_path_buf(),
            tree,
            shutdown,
            accept_task: Some(accept_task),
        };

        if let Err(e) = probe(&server.address, timeout).await {
            if let Err(stop_err) = server.stop().await {
                warn!(%socket, error = %stop_err, "failed to stop unresponsive coordination service");
            }
            return Err(e);
        }

        info!(%socket, data_dir = %data_dir.display(), "coordination service started");
        Ok(server)
    }

    /// The root address of the service.
    pub fn address(&self) -> &CoordinationAddress {
        &self.address
    }

    /// Stops the service. Idempotent.
    ///
    /// The listener and all sessions are released before any error is
    /// reported.
    pub async fn stop(&mut self) -> Result<(), CoordinationError> {
        let Some(accept_task) = self.accept_task.take() else {
            return Ok(());
        };

        let _ = self.shutdown.send(true);
        let joined = accept_task.await;
        let saved = self.save_snapshot().await;

        joined.map_err(|e| CoordinationError::TaskFailed(e.to_string()))?;
        saved?;

        info!(socket = %self.address.socket(), "coordination service stopped");
        Ok(())
    }

    async fn save_snapshot(&self) -> Result<(), CoordinationError> {
        let snapshot = self.tree.lock().await.snapshot();
        let content = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(self.data_dir.join(SNAPSHOT_FILE), content).await?;
        Ok(())
    }
}

impl Drop for CoordinationServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            warn!(socket = %self.address.socket(), "coordination service dropped while running");
            let _ = self.shutdown.send(true);
            task.abort();
        }
    }
}

async fn load_snapshot(data_dir: &Path) -> Result<Tree, CoordinationError> {
    let path = data_dir.join(SNAPSHOT_FILE);
    match tokio::fs::read(&path).await {
        Ok(content) => {
            let snapshot = serde_json::from_slice(&content)?;
            debug!(path = %path.display(), "restored coordination snapshot");
            Ok(Tree::restore(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Tree::new()),
        Err(e) => Err(e.into()),
    }
}

async fn probe(address: &CoordinationAddress, timeout: Duration) -> Result<(), CoordinationError> {
    let attempt = async {
        let mut client = CoordinationClient::connect(address, timeout).await?;
        client.ping().await?;
        client.close().await
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| CoordinationError::Timeout(timeout))?
}

async fn accept_loop(listener: TcpListener, tree: SharedTree, mut shutdown: watch::Receiver<bool>) {
    let mut sessions = JoinSet::new();
    let mut next_session: SessionId = 1;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session = next_session;
                    next_session += 1;
                    sessions.spawn(serve_session(stream, peer, session, tree.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "failed to accept coordination connection"),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    sessions.shutdown().await;
}

async fn serve_session(
    stream: TcpStream,
    peer: SocketAddr,
    session: SessionId,
    tree: SharedTree,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, session, "session opened");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, session, error = %e, "session read failed");
                break;
            }
        };

        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(%peer, session, error = %e, "malformed coordination request");
                break;
            }
        };
        let response = tree.lock().await.apply(request, session);

        let Ok(mut payload) = serde_json::to_vec(&response) else {
            break;
        };
        payload.push(b'\n');
        if writer.write_all(&payload).await.is_err() {
            break;
        }
    }

    let expired = tree.lock().await.expire_session(session);
    debug!(%peer, session, expired, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn create(path: &str) -> Request {
        Request::Create {
            path: path.to_string(),
            data: Vec::new(),
            ephemeral: false,
        }
    }

    #[test]
    fn test_tree_requires_parent() {
        let mut tree = Tree::new();
        assert_eq!(
            tree.apply(create("/a/b"), 1),
            error(ErrorCode::NoNode, "/a/b".to_string())
        );
        assert_eq!(tree.apply(create("/a"), 1), Response::Ok);
        assert_eq!(tree.apply(create("/a/b"), 1), Response::Ok);
        assert_eq!(
            tree.apply(create("/a"), 1),
            error(ErrorCode::NodeExists, "/a".to_string())
        );
    }

    #[test]
    fn test_tree_children_are_direct_only() {
        let mut tree = Tree::new();
        for path in ["/a", "/a/b", "/a/b/c", "/a/d", "/ab"] {
            assert_eq!(tree.apply(create(path), 1), Response::Ok);
        }

        let children = tree.apply(
            Request::Children {
                path: "/a".to_string(),
            },
            1,
        );
        assert_eq!(
            children,
            Response::Children {
                children: vec!["b".to_string(), "d".to_string()]
            }
        );

        let root = tree.apply(
            Request::Children {
                path: "/".to_string(),
            },
            1,
        );
        assert_eq!(
            root,
            Response::Children {
                children: vec!["a".to_string(), "ab".to_string()]
            }
        );
    }

    #[test]
    fn test_tree_delete_refuses_non_empty() {
        let mut tree = Tree::new();
        tree.apply(create("/a"), 1);
        tree.apply(create("/a/b"), 1);

        let delete = |path: &str| Request::Delete {
            path: path.to_string(),
        };
        assert_eq!(
            tree.apply(delete("/a"), 1),
            error(ErrorCode::NotEmpty, "/a".to_string())
        );
        assert_eq!(tree.apply(delete("/a/b"), 1), Response::Ok);
        assert_eq!(tree.apply(delete("/a"), 1), Response::Ok);
        assert_eq!(
            tree.apply(delete("/"), 1),
            error(ErrorCode::BadPath, "/".to_string())
        );
    }

    #[test]
    fn test_expire_session_removes_only_its_ephemerals() {
        let mut tree = Tree::new();
        tree.apply(create("/live"), 1);
        for (path, session) in [("/live/n1", 7), ("/live/n2", 8)] {
            let request = Request::Create {
                path: path.to_string(),
                data: Vec::new(),
                ephemeral: true,
            };
            assert_eq!(tree.apply(request, session), Response::Ok);
        }

        assert_eq!(tree.expire_session(7), 1);
        assert!(!tree.entries.contains_key("/live/n1"));
        assert!(tree.entries.contains_key("/live/n2"));
        assert!(tree.entries.contains_key("/live"));
        assert!(!tree.snapshot().contains_key("/live/n2"));
    }

    #[tokio::test]
    async fn test_start_serve_stop() {
        let temp = TempDir::new().unwrap();
        let mut server = CoordinationServer::start(temp.path(), 0, TIMEOUT)
            .await
            .unwrap();

        let mut client = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        client.put("/configs/demo/schema.xml", b"<schema/>").await.unwrap();
        assert_eq!(
            client.get_data("/configs/demo/schema.xml").await.unwrap(),
            b"<schema/>"
        );
        client.close().await.unwrap();

        server.stop().await.unwrap();
        assert!(CoordinationClient::connect(server.address(), TIMEOUT).await.is_err());
        assert!(temp.path().join(SNAPSHOT_FILE).exists());

        // Idempotent.
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_restored_on_restart() {
        let temp = TempDir::new().unwrap();

        let mut server = CoordinationServer::start(temp.path(), 0, TIMEOUT)
            .await
            .unwrap();
        let mut client = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        client.put("/configs/demo", b"x").await.unwrap();
        client.close().await.unwrap();
        server.stop().await.unwrap();

        let mut server = CoordinationServer::start(temp.path(), 0, TIMEOUT)
            .await
            .unwrap();
        let mut client = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        assert!(client.exists("/configs/demo").await.unwrap());
        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_conflict_fails_start() {
        let temp = TempDir::new().unwrap();
        let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = occupied.local_addr().unwrap().port();

        let result = CoordinationServer::start(temp.path(), port, TIMEOUT).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ephemeral_entries_expire_with_session() {
        let temp = TempDir::new().unwrap();
        let mut server = CoordinationServer::start(temp.path(), 0, TIMEOUT)
            .await
            .unwrap();

        let mut owner = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        owner.create_all("/live_nodes").await.unwrap();
        owner
            .create_ephemeral("/live_nodes/n1", &[])
            .await
            .unwrap();
        owner.close().await.unwrap();

        let mut observer = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        let mut remaining = observer.children("/live_nodes").await.unwrap();
        for _ in 0..50 {
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = observer.children("/live_nodes").await.unwrap();
        }
        assert!(remaining.is_empty());

        observer.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_chroot_scopes_paths() {
        let temp = TempDir::new().unwrap();
        let mut server = CoordinationServer::start(temp.path(), 0, TIMEOUT)
            .await
            .unwrap();

        let mut root = CoordinationClient::connect(server.address(), TIMEOUT)
            .await
            .unwrap();
        root.create_all("/run1").await.unwrap();

        let scoped_address = server.address().with_chroot("/run1");
        let mut scoped = CoordinationClient::connect(&scoped_address, TIMEOUT)
            .await
            .unwrap();
        scoped.put("/configs/a", b"1").await.unwrap();

        assert!(root.exists("/run1/configs/a").await.unwrap());
        assert!(!root.exists("/configs").await.unwrap());
        assert_eq!(scoped.children("/").await.unwrap(), vec!["configs"]);

        scoped.close().await.unwrap();
        root.close().await.unwrap();
        server.stop().await.unwrap();
    }
}
