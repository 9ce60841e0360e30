//! Shared types for tailcast
//!
//! This crate contains data structures used across multiple tailcast crates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("invalid stream kind '{0}', expected stdout or stderr")]
    InvalidStreamKind(String),
}

// ============================================================================
// Stream Selection
// ============================================================================

/// One of the two output channels of a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl FromStr for StreamKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(TypesError::InvalidStreamKind(other.to_string())),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (process, stream kind) pair a subscriber asked for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamSelector {
    pub process: String,
    pub kind: StreamKind,
}

impl StreamSelector {
    pub fn new(process: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            process: process.into(),
            kind,
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process, self.kind)
    }
}

/// Log file locations of a resolved process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl ProcessLogPaths {
    pub fn new(stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Pick the file backing the given stream kind
    pub fn path_for(&self, kind: StreamKind) -> &Path {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }
}

// ============================================================================
// Connection Identity
// ============================================================================

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifier of one accepted subscriber connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Build an id from the selector and the current time
    pub fn generate(selector: &StreamSelector) -> Self {
        let millis = Utc::now().timestamp_millis();
        let seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{}_{}_{}_{}",
            selector.process, selector.kind, millis, seq
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Wire Messages
// ============================================================================

/// Messages pushed to subscribers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once after the subscription is registered
    Connected { message: String },
    /// Newly appended lines, already converted to HTML
    Log { data: String },
    /// Reply to a client ping
    Pong,
}

impl ServerMessage {
    pub fn connected(selector: &StreamSelector) -> Self {
        Self::Connected {
            message: format!(
                "connected to {} log stream of {}",
                selector.kind, selector.process
            ),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Messages accepted from subscribers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    /// Any other `type` value
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_parse() {
        assert_eq!("stdout".parse::<StreamKind>().unwrap(), StreamKind::Stdout);
        assert_eq!("stderr".parse::<StreamKind>().unwrap(), StreamKind::Stderr);
        assert!("STDOUT".parse::<StreamKind>().is_err());
        assert!("".parse::<StreamKind>().is_err());
    }

    #[test]
    fn test_path_for() {
        let paths = ProcessLogPaths::new("/var/log/web.out", "/var/log/web.err");
        assert_eq!(paths.path_for(StreamKind::Stdout), Path::new("/var/log/web.out"));
        assert_eq!(paths.path_for(StreamKind::Stderr), Path::new("/var/log/web.err"));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let selector = StreamSelector::new("web", StreamKind::Stdout);
        let a = ConnectionId::generate(&selector);
        let b = ConnectionId::generate(&selector);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("web_stdout_"));
    }

    #[test]
    fn test_server_message_shapes() {
        let log = ServerMessage::Log {
            data: "hello".to_string(),
        };
        assert_eq!(log.to_json(), r#"{"type":"log","data":"hello"}"#);
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);

        let connected = ServerMessage::connected(&StreamSelector::new("web", StreamKind::Stderr));
        let value: serde_json::Value = serde_json::from_str(&connected.to_json()).unwrap();
        assert_eq!(value["type"], "connected");
        assert!(value["message"].as_str().unwrap().contains("web"));
    }

    #[test]
    fn test_client_message_parse() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap(),
            ClientMessage::Unknown
        );
        assert!(ClientMessage::parse("not json").is_err());
    }
}
