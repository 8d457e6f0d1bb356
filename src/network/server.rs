//! TCP server exposing a backing node over the framed protocol.

use crate::error::Result;
use crate::network::rpc::{read_frame, write_frame, NodeCommand, NodeReply, NodeRequest, NodeResponse};
use crate::storage::{MemoryNode, NodeClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Executes commands received by a [`NodeServer`].
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Execute one command.
    async fn handle(&self, command: NodeCommand) -> NodeReply;
}

/// Serves commands from any [`NodeClient`], typically a [`MemoryNode`].
pub struct StoreHandler {
    store: Arc<dyn NodeClient>,
}

impl StoreHandler {
    /// Wrap a store.
    pub fn new(store: Arc<dyn NodeClient>) -> Self {
        Self { store }
    }
}

fn reply<T>(result: Result<T>, ok: impl FnOnce(T) -> NodeReply) -> NodeReply {
    match result {
        Ok(value) => ok(value),
        Err(e) => NodeReply::Error(e.to_string()),
    }
}

#[async_trait]
impl CommandHandler for StoreHandler {
    async fn handle(&self, command: NodeCommand) -> NodeReply {
        match command {
            NodeCommand::Get { key } => reply(self.store.get(&key).await, |v| {
                NodeReply::Value(v.map(|b| b.to_vec()))
            }),
            NodeCommand::GetWithTtl { key } => {
                reply(self.store.get_with_ttl(&key).await, NodeReply::Entry)
            }
            NodeCommand::Set { key, value, ttl_ms } => reply(
                self.store
                    .set(&key, Bytes::from(value), ttl_ms.map(Duration::from_millis))
                    .await,
                |_| NodeReply::Ok,
            ),
            NodeCommand::Del { key } => reply(self.store.del(&key).await, NodeReply::Existed),
            NodeCommand::Expire { key, ttl_ms } => reply(
                self.store.expire(&key, Duration::from_millis(ttl_ms)).await,
                NodeReply::Existed,
            ),
            NodeCommand::Keys { prefix } => reply(self.store.keys(&prefix).await, NodeReply::Keys),
            NodeCommand::Ping => reply(self.store.ping().await, |_| NodeReply::Pong),
        }
    }
}

/// TCP server for one backing node.
pub struct NodeServer {
    /// Bound listener.
    listener: TcpListener,

    /// Command handler.
    handler: Arc<dyn CommandHandler>,

    /// Stops the accept loop and open connections.
    shutdown: CancellationToken,
}

impl NodeServer {
    /// Bind a server. Use port 0 to let the OS pick one.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind a server in front of a memory node.
    pub async fn for_memory_node(addr: SocketAddr, node: Arc<MemoryNode>) -> Result<Self> {
        Self::bind(addr, Arc::new(StoreHandler::new(node))).await
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the accept loop until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Node server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = Self::handle_connection(stream, handler) => {
                                        if let Err(e) = result {
                                            debug!(error = %e, "Connection handler error");
                                        }
                                    }
                                    _ = shutdown.cancelled() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(addr = %addr, "Node server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn CommandHandler>) -> Result<()> {
        stream.set_nodelay(true)?;

        while let Some(request) = read_frame::<_, NodeRequest>(&mut stream).await? {
            let mut replies = Vec::with_capacity(request.commands.len());
            for command in request.commands {
                replies.push(handler.handle(command).await);
            }

            let response = NodeResponse {
                request_id: request.request_id,
                replies,
            };
            write_frame(&mut stream, &response).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_handler_commands() {
        let node = Arc::new(MemoryNode::new("n1"));
        let handler = StoreHandler::new(node.clone());

        let set = handler
            .handle(NodeCommand::Set {
                key: "k".into(),
                value: b"v".to_vec(),
                ttl_ms: None,
            })
            .await;
        assert_eq!(set, NodeReply::Ok);

        let get = handler.handle(NodeCommand::Get { key: "k".into() }).await;
        assert_eq!(get, NodeReply::Value(Some(b"v".to_vec())));

        node.set_available(false);
        let ping = handler.handle(NodeCommand::Ping).await;
        assert!(matches!(ping, NodeReply::Error(_)));
    }

    #[tokio::test]
    async fn test_server_accepts_connections() {
        let node = Arc::new(MemoryNode::new("n1"));
        let server = NodeServer::for_memory_node("127.0.0.1:0".parse().unwrap(), node)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();

        let handle = tokio::spawn(server.run());

        let result = TcpStream::connect(addr).await;
        assert!(result.is_ok());

        token.cancel();
        let _ = handle.await;
    }
}
