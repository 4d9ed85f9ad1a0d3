use std::path::PathBuf;

use thiserror::Error;

use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load key {path:?}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Host key for {host} does not match the trusted record")]
    HostKeyMismatch { host: String },

    #[error("Host {host} is not in the trust store")]
    UnknownHost { host: String },

    #[error("Public key authentication rejected for user {user}")]
    AuthRejected { user: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Agent returned status {status}: {body}")]
    AgentStatus { status: u16, body: String },

    #[error("Provider {provider} error: {reason}")]
    Provider {
        provider: String,
        reason: String,
        retryable: bool,
    },

    #[error("Provider not registered: {0}")]
    ProviderNotFound(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{op} on node {node} failed: {source}")]
    NodeFailure {
        node: String,
        op: &'static str,
        #[source]
        source: Box<FleetError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Host identity, integrity, authorization and configuration failures
    /// are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Connect { .. } | FleetError::Timeout(_) | FleetError::Io(_) => true,
            FleetError::Ssh(_) => true,
            FleetError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            FleetError::AgentStatus { status, .. } => *status == 429 || *status >= 500,
            FleetError::Provider { retryable, .. } => *retryable,
            FleetError::NodeFailure { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap this error with the node and operation it came from.
    pub fn on_node(self, node: impl Into<String>, op: &'static str) -> Self {
        FleetError::NodeFailure {
            node: node.into(),
            op,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping node context wrappers.
    pub fn root(&self) -> &FleetError {
        match self {
            FleetError::NodeFailure { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_mismatch_is_not_transient() {
        let err = FleetError::HostKeyMismatch {
            host: "10.0.0.1".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn connect_failure_is_transient() {
        let err = FleetError::Connect {
            addr: "10.0.0.1:22".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn agent_status_classification() {
        let server = FleetError::AgentStatus {
            status: 503,
            body: String::new(),
        };
        let limited = FleetError::AgentStatus {
            status: 429,
            body: String::new(),
        };
        let client = FleetError::AgentStatus {
            status: 400,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(limited.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn node_context_preserves_root_and_classification() {
        let err = FleetError::ChecksumMismatch {
            path: "/tmp/x".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        }
        .on_node("node-1", "transfer");

        assert!(!err.is_transient());
        assert!(matches!(err.root(), FleetError::ChecksumMismatch { .. }));
        assert!(err.to_string().contains("node-1"));
    }
}
