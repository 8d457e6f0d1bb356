//! TCP client for backing nodes.

use crate::config::NodeConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, NodeCommand, NodeReply, NodeRequest, NodeResponse};
use crate::storage::{NodeClient, NodeConnector, WriteEntry};
use crate::types::{ttl_to_millis, NodeId, StoredEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Client for one backing node speaking the framed protocol.
///
/// The connection is opened on first use and dropped after any I/O error,
/// protocol error or cancelled call, so the next call reconnects. Requests
/// on one client are serialized.
pub struct TcpNodeClient {
    /// Node identifier.
    id: NodeId,

    /// `host:port` of the node.
    addr: String,

    /// Deadline for establishing a connection.
    connect_timeout: Duration,

    /// Cached connection.
    stream: Mutex<Option<TcpStream>>,

    /// Next request id.
    next_request_id: AtomicU64,
}

impl TcpNodeClient {
    /// Create a client. No connection is made until the first call.
    pub fn new(node: &NodeConfig, connect_timeout: Duration) -> Self {
        Self {
            id: node.id(),
            addr: node.address(),
            connect_timeout,
            stream: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Address of the node.
    pub fn address(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(node = %self.id, addr = %self.addr, "Connected to backing node");
        Ok(stream)
    }

    /// Send a batch of commands and return one reply per command.
    pub async fn execute(&self, commands: Vec<NodeCommand>) -> Result<Vec<NodeReply>> {
        let expected = commands.len();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = NodeRequest::new(request_id, commands);

        // The stream is owned by this call until the reply is read, so a
        // cancelled or failed round trip leaves no unread reply behind.
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let response = Self::round_trip(&mut stream, &request).await?;
        if response.request_id != request_id || response.replies.len() != expected {
            return Err(NetworkError::Protocol(format!(
                "unexpected response {} with {} replies for request {}",
                response.request_id,
                response.replies.len(),
                request_id
            ))
            .into());
        }
        *guard = Some(stream);
        drop(guard);

        trace!(node = %self.id, request_id, commands = expected, "Request completed");
        Ok(response.replies)
    }

    async fn round_trip(stream: &mut TcpStream, request: &NodeRequest) -> Result<NodeResponse> {
        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| Error::Network(NetworkError::ConnectionClosed))
    }

    async fn execute_one(&self, command: NodeCommand) -> Result<NodeReply> {
        self.execute(vec![command])
            .await?
            .pop()
            .ok_or_else(|| NetworkError::Protocol("empty response".to_string()).into())
    }
}

fn unexpected(reply: NodeReply) -> Error {
    match reply {
        NodeReply::Error(message) => NetworkError::Remote(message).into(),
        other => NetworkError::Protocol(format!("unexpected reply {:?}", other)).into(),
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    fn node_id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.execute_one(NodeCommand::Get { key: key.to_string() }).await? {
            NodeReply::Value(value) => Ok(value.map(Bytes::from)),
            other => Err(unexpected(other)),
        }
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self
            .execute_one(NodeCommand::GetWithTtl { key: key.to_string() })
            .await?
        {
            NodeReply::Entry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let command = NodeCommand::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl_ms: ttl_to_millis(ttl),
        };
        match self.execute_one(command).await? {
            NodeReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        match self.execute_one(NodeCommand::Del { key: key.to_string() }).await? {
            NodeReply::Existed(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let command = NodeCommand::Expire {
            key: key.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        };
        match self.execute_one(command).await? {
            NodeReply::Existed(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let commands = keys
            .iter()
            .map(|key| NodeCommand::Get { key: key.clone() })
            .collect();

        self.execute(commands)
            .await?
            .into_iter()
            .map(|reply| match reply {
                NodeReply::Value(value) => Ok(value.map(Bytes::from)),
                other => Err(unexpected(other)),
            })
            .collect()
    }

    async fn mset(&self, entries: Vec<WriteEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let commands = entries
            .into_iter()
            .map(|entry| NodeCommand::Set {
                key: entry.key,
                value: entry.value.to_vec(),
                ttl_ms: ttl_to_millis(entry.ttl),
            })
            .collect();

        for reply in self.execute(commands).await? {
            if reply != NodeReply::Ok {
                return Err(unexpected(reply));
            }
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        match self
            .execute_one(NodeCommand::Keys {
                prefix: prefix.to_string(),
            })
            .await?
        {
            NodeReply::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    async fn ping(&self) -> Result<()> {
        match self.execute_one(NodeCommand::Ping).await? {
            NodeReply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
            debug!(node = %self.id, "Connection closed");
        }
    }
}

impl std::fmt::Debug for TcpNodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpNodeClient")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Connector creating [`TcpNodeClient`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect deadline.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl NodeConnector for TcpConnector {
    fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>> {
        Ok(Arc::new(TcpNodeClient::new(node, self.connect_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NodeServer;
    use crate::storage::MemoryNode;

    async fn start_server() -> (Arc<MemoryNode>, TcpNodeClient, tokio_util::sync::CancellationToken) {
        let node = Arc::new(MemoryNode::new("backing"));
        let server = NodeServer::for_memory_node("127.0.0.1:0".parse().unwrap(), node.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();
        tokio::spawn(server.run());

        let config = NodeConfig::new(addr.ip().to_string(), addr.port());
        let client = TcpNodeClient::new(&config, Duration::from_secs(1));
        (node, client, token)
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let (node, client, token) = start_server().await;

        client.ping().await.unwrap();
        client
            .set("k", Bytes::from("v"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(client.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(node.peek("k").await, Some(Bytes::from("v")));

        let entry = client.get_with_ttl("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v".to_vec());
        assert!(entry.ttl_ms.unwrap() <= 60_000);

        assert!(client.del("k").await.unwrap());
        assert_eq!(client.get("k").await.unwrap(), None);

        token.cancel();
    }

    #[tokio::test]
    async fn test_client_batches() {
        let (_node, client, token) = start_server().await;

        client
            .mset(vec![
                WriteEntry::new("a", "1", None),
                WriteEntry::new("b", "2", None),
            ])
            .await
            .unwrap();

        let values = client
            .mget(&["a".to_string(), "x".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(Bytes::from("1")), None, Some(Bytes::from("2"))]);

        token.cancel();
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_as_network_error() {
        let (node, client, token) = start_server().await;

        node.set_available(false);
        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::Remote(_))));

        node.set_available(true);
        assert!(client.ping().await.is_ok());

        token.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_call_does_not_desync_connection() {
        let (node, client, token) = start_server().await;
        client.set("k", Bytes::from("v"), None).await.unwrap();

        node.set_latency(Duration::from_millis(100));
        let cancelled = tokio::time::timeout(Duration::from_millis(10), client.get("k")).await;
        assert!(cancelled.is_err());

        // Later calls must read their own replies, not the abandoned one.
        node.set_latency(Duration::ZERO);
        client.set("other", Bytes::from("w"), None).await.unwrap();
        assert_eq!(client.get("other").await.unwrap(), Some(Bytes::from("w")));
        assert_eq!(client.get("k").await.unwrap(), Some(Bytes::from("v")));
        client.ping().await.unwrap();

        token.cancel();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Nothing listens on port 1.
        let client = TcpNodeClient::new(&NodeConfig::new("127.0.0.1", 1), Duration::from_millis(200));
        let err = client.ping().await.unwrap_err();
        assert!(err.is_transient());
    }
}
