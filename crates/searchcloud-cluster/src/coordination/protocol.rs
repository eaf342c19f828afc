//! Request/response messages exchanged with the coordination service.
//!
//! Each message is one JSON document terminated by a newline.

use serde::{Deserialize, Serialize};

/// A request sent by a coordination client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Exists {
        path: String,
    },
    Create {
        path: String,
        data: Vec<u8>,
        ephemeral: bool,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    GetData {
        path: String,
    },
    Children {
        path: String,
    },
    Delete {
        path: String,
    },
}

/// Failure categories reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoNode,
    NodeExists,
    NotEmpty,
    BadPath,
}

/// The service's answer to a single [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Pong,
    Exists { exists: bool },
    Data { data: Vec<u8> },
    Children { children: Vec<String> },
    Error { code: ErrorCode, path: String },
}

/// Validates an absolute, normalized path: `/`, or `/a/b` without empty
/// segments or a trailing slash.
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/')
        && !path.ends_with('/')
        && path[1..]
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Returns the parent of a valid non-root path.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Joins a child name onto a base path.
pub fn join(base: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if base == "/" || base.is_empty() {
        format!("/{child}")
    } else {
        format!("{base}/{child}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/configs"));
        assert!(is_valid_path("/configs/default/lang/stopwords_en.txt"));

        assert!(!is_valid_path(""));
        assert!(!is_valid_path("configs"));
        assert!(!is_valid_path("/configs/"));
        assert!(!is_valid_path("/configs//x"));
        assert!(!is_valid_path("/configs/../x"));
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));

        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/a", "/b"), "/a/b");
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let line = serde_json::to_string(&Request::Exists {
            path: "/configs".to_string(),
        })
        .unwrap();
        assert_eq!(line, r#"{"op":"exists","path":"/configs"}"#);

        let response: Response =
            serde_json::from_str(r#"{"status":"error","code":"no_node","path":"/x"}"#).unwrap();
        assert_eq!(
            response,
            Response::Error {
                code: ErrorCode::NoNode,
                path: "/x".to_string()
            }
        );
    }
}
