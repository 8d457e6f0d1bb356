//! Backing-node abstraction.
//!
//! A backing node is an opaque key-value service. The cluster layer talks to
//! it only through [`NodeClient`]; [`NodeConnector`] creates clients for nodes
//! that join at runtime.
//!
//! Two implementations ship with the crate:
//! - [`MemoryNode`]: an in-process store backed by Moka, with failure
//!   injection for tests.
//! - [`TcpNodeClient`](crate::network::TcpNodeClient): a client for the
//!   framed TCP protocol served by [`NodeServer`](crate::network::NodeServer).

pub mod memory;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::types::{NodeId, StoredEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{MemoryConnector, MemoryNode};

/// A value to write with its optional TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    /// Key to write.
    pub key: String,
    /// Serialized value.
    pub value: Bytes,
    /// Optional time to live.
    pub ttl: Option<Duration>,
}

impl WriteEntry {
    /// Create a write entry.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Connection to a single backing node.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// The node this client talks to.
    fn node_id(&self) -> &str;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Read a value together with its remaining TTL.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Write a value.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Set a TTL on an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Read several values in one round trip.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Write several values in one round trip.
    async fn mset(&self, entries: Vec<WriteEntry>) -> Result<()>;

    /// List keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    /// Release the connection. Further calls may reconnect.
    async fn close(&self) {}
}

/// Creates clients for backing nodes.
pub trait NodeConnector: Send + Sync + 'static {
    /// Create a client for the node. Connections may be established lazily.
    fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>>;
}

/// Shared handle to a node client.
pub type SharedClient = Arc<dyn NodeClient>;

/// Convenience for logging and maps keyed by id.
pub fn client_id(client: &SharedClient) -> NodeId {
    client.node_id().to_string()
}
