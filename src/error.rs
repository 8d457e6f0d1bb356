//! Error types for the replicated cache.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the replicated cache.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Network communication errors with a backing node.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A backing-node call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The configured consistency level's success threshold was not met.
    #[error("{operation} did not reach consistency threshold: {achieved}/{required} replicas")]
    QuorumNotReached {
        operation: &'static str,
        required: usize,
        achieved: usize,
    },

    /// Invalid node list or replication parameters.
    #[error("config error: {0}")]
    Config(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The key is empty or uses a reserved prefix.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The node is not a cluster member.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The ring has no nodes to place a key on.
    #[error("no nodes available in the ring")]
    NoNodes,

    /// The service is shutting down and no longer accepts operations.
    #[error("cache is shutting down")]
    ShuttingDown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is worth retrying at the cluster layer.
    ///
    /// Only network failures and timeouts are transient. Everything else
    /// (bad configuration, bad input, threshold failures) fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }

    /// Create a threshold failure for the given operation.
    pub fn quorum(operation: &'static str, required: usize, achieved: usize) -> Self {
        Error::QuorumNotReached {
            operation,
            required,
            achieved,
        }
    }
}

/// Network communication errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send a frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote node reported an error for a command.
    #[error("remote error: {0}")]
    Remote(String),

    /// The response did not match the request.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::Io(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::from(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Protocol(e.to_string()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
