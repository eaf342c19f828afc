//! Embedded coordination service.
//!
//! A small path tree served over TCP. Nodes register under it, and
//! configuration sets and collection state live in it. Every client
//! operates inside an isolation namespace (chroot) carried by its
//! [`CoordinationAddress`].

mod client;
pub mod protocol;
mod server;

pub use client::CoordinationClient;
pub use server::CoordinationServer;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to, or running, the coordination service.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// The path does not exist.
    #[error("No node at {0}")]
    NoNode(String),

    /// The path already exists.
    #[error("Node already exists at {0}")]
    NodeExists(String),

    /// The path still has children.
    #[error("Node {0} has children")]
    NotEmpty(String),

    /// The path is not absolute and normalized.
    #[error("Invalid path {0:?}")]
    BadPath(String),

    /// Could not connect to the service.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The service did not answer in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The service closed the connection.
    #[error("Connection closed by coordination service")]
    Closed,

    /// An earlier request on this session timed out.
    #[error("Session unusable after an earlier request timed out")]
    Poisoned,

    /// The service answered with a response that does not fit the request.
    #[error("Unexpected response: {0}")]
    Unexpected(String),

    /// The accept loop ended abnormally.
    #[error("Coordination service task failed: {0}")]
    TaskFailed(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Address of a running coordination service plus the namespace clients
/// connecting through it are confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationAddress {
    socket: SocketAddr,
    chroot: String,
}

impl CoordinationAddress {
    /// Creates an address at the root of the tree.
    pub fn new(socket: SocketAddr) -> Self {
        Self {
            socket,
            chroot: String::new(),
        }
    }

    /// Returns the same service address confined to `chroot`.
    ///
    /// An empty string or `/` means the root.
    pub fn with_chroot(&self, chroot: &str) -> Self {
        Self {
            socket: self.socket,
            chroot: normalize_chroot(chroot),
        }
    }

    /// Returns the same service address without a namespace.
    pub fn root(&self) -> Self {
        Self::new(self.socket)
    }

    /// The socket the service listens on.
    pub fn socket(&self) -> SocketAddr {
        self.socket
    }

    /// The namespace, empty for the root.
    pub fn chroot(&self) -> &str {
        &self.chroot
    }
}

impl fmt::Display for CoordinationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.socket, self.chroot)
    }
}

fn normalize_chroot(chroot: &str) -> String {
    chroot
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(String::new(), |mut path, segment| {
            path.push('/');
            path.push_str(segment);
            path
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let socket: SocketAddr = "127.0.0.1:8889".parse().unwrap();
        let address = CoordinationAddress::new(socket);
        assert_eq!(address.to_string(), "127.0.0.1:8889");

        let scoped = address.with_chroot("searchcloud/");
        assert_eq!(scoped.chroot(), "/searchcloud");
        assert_eq!(scoped.to_string(), "127.0.0.1:8889/searchcloud");
        assert_eq!(scoped.root(), address);
    }

    #[test]
    fn test_empty_chroot_is_root() {
        let socket: SocketAddr = "127.0.0.1:8889".parse().unwrap();
        let address = CoordinationAddress::new(socket);
        assert_eq!(address.with_chroot("").chroot(), "");
        assert_eq!(address.with_chroot("/").chroot(), "");
    }

    #[test]
    fn test_chroot_collapses_empty_segments() {
        let socket: SocketAddr = "127.0.0.1:8889".parse().unwrap();
        let address = CoordinationAddress::new(socket);
        assert_eq!(address.with_chroot("a//b").chroot(), "/a/b");
        assert_eq!(address.with_chroot("//a///b//").chroot(), "/a/b");
    }
}
