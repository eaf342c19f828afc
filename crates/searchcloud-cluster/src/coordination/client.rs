//! Coordination service client.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::protocol::{self, ErrorCode, Request, Response};
use super::{CoordinationAddress, CoordinationError};

type ClientResult<T> = std::result::Result<T, CoordinationError>;

/// A single connection (session) to the coordination service.
///
/// All paths are relative to the address's chroot. Ephemeral entries created
/// through this client disappear when it is dropped.
///
/// A request that times out leaves the session unusable: its late reply
/// would be read as the answer to the next request, so every later call
/// fails with [`CoordinationError::Poisoned`].
pub struct CoordinationClient {
    address: CoordinationAddress,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    poisoned: bool,
}

impl CoordinationClient {
    /// Connects to the service, giving up after `timeout`.
    pub async fn connect(address: &CoordinationAddress, timeout: Duration) -> ClientResult<Self> {
        let socket = address.socket();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(socket)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(CoordinationError::Connect {
                    addr: socket,
                    source,
                });
            }
            Err(_) => return Err(CoordinationError::Timeout(timeout)),
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        debug!(%address, "coordination session opened");

        Ok(Self {
            address: address.clone(),
            lines: BufReader::new(reader).lines(),
            writer,
            timeout,
            poisoned: false,
        })
    }

    /// Returns the address this client is connected to.
    pub fn address(&self) -> &CoordinationAddress {
        &self.address
    }

    /// Round-trips a ping.
    pub async fn ping(&mut self) -> ClientResult<()> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns whether `path` exists.
    pub async fn exists(&mut self, path: &str) -> ClientResult<bool> {
        let path = self.resolve(path)?;
        match self.call(Request::Exists { path }).await? {
            Response::Exists { exists } => Ok(exists),
            other => Err(unexpected(&other)),
        }
    }

    /// Creates a persistent entry. The parent must exist.
    pub async fn create(&mut self, path: &str, data: &[u8]) -> ClientResult<()> {
        self.create_entry(path, data, false).await
    }

    /// Creates an entry tied to this session.
    pub async fn create_ephemeral(&mut self, path: &str, data: &[u8]) -> ClientResult<()> {
        self.create_entry(path, data, true).await
    }

    /// Creates `path` and any missing ancestors as empty persistent entries.
    pub async fn create_all(&mut self, path: &str) -> ClientResult<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if self.exists(&current).await? {
                continue;
            }
            match self.create(&current, &[]).await {
                Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes `data` at `path`, creating the entry and its ancestors when
    /// needed.
    pub async fn put(&mut self, path: &str, data: &[u8]) -> ClientResult<()> {
        if let Some(parent) = protocol::parent(path) {
            self.create_all(parent).await?;
        }
        match self.create(path, data).await {
            Err(CoordinationError::NodeExists(_)) => self.set_data(path, data).await,
            other => other,
        }
    }

    /// Replaces the data of an existing entry.
    pub async fn set_data(&mut self, path: &str, data: &[u8]) -> ClientResult<()> {
        let path = self.resolve(path)?;
        let request = Request::SetData {
            path,
            data: data.to_vec(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Reads the data of an entry.
    pub async fn get_data(&mut self, path: &str) -> ClientResult<Vec<u8>> {
        let path = self.resolve(path)?;
        match self.call(Request::GetData { path }).await? {
            Response::Data { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    /// Lists the names of the direct children of `path`, sorted.
    pub async fn children(&mut self, path: &str) -> ClientResult<Vec<String>> {
        let path = self.resolve(path)?;
        match self.call(Request::Children { path }).await? {
            Response::Children { children } => Ok(children),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes an entry without children.
    pub async fn delete(&mut self, path: &str) -> ClientResult<()> {
        let path = self.resolve(path)?;
        match self.call(Request::Delete { path }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Closes the session, expiring its ephemeral entries.
    pub async fn close(mut self) -> ClientResult<()> {
        self.writer.shutdown().await?;
        debug!(address = %self.address, "coordination session closed");
        Ok(())
    }

    async fn create_entry(&mut self, path: &str, data: &[u8], ephemeral: bool) -> ClientResult<()> {
        let path = self.resolve(path)?;
        let request = Request::Create {
            path,
            data: data.to_vec(),
            ephemeral,
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&mut self, request: Request) -> ClientResult<Response> {
        if self.poisoned {
            return Err(CoordinationError::Poisoned);
        }

        let timeout = self.timeout;
        let response = match tokio::time::timeout(timeout, self.round_trip(&request)).await {
            Ok(response) => response?,
            Err(_) => {
                self.poisoned = true;
                return Err(CoordinationError::Timeout(timeout));
            }
        };

        match response {
            Response::Error { code, path } => Err(match code {
                ErrorCode::NoNode => CoordinationError::NoNode(path),
                ErrorCode::NodeExists => CoordinationError::NodeExists(path),
                ErrorCode::NotEmpty => CoordinationError::NotEmpty(path),
                ErrorCode::BadPath => CoordinationError::BadPath(path),
            }),
            response => Ok(response),
        }
    }

    async fn round_trip(&mut self, request: &Request) -> ClientResult<Response> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or(CoordinationError::Closed)?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Maps a namespace-relative path to the absolute path on the service.
    fn resolve(&self, path: &str) -> ClientResult<String> {
        if !protocol::is_valid_path(path) {
            return Err(CoordinationError::BadPath(path.to_string()));
        }
        let chroot = self.address.chroot();
        Ok(match (chroot.is_empty(), path) {
            (true, _) => path.to_string(),
            (false, "/") => chroot.to_string(),
            (false, _) => format!("{chroot}{path}"),
        })
    }
}

fn unexpected(response: &Response) -> CoordinationError {
    CoordinationError::Unexpected(format!("{response:?}"))
}
