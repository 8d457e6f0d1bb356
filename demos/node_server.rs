//! A standalone backing node: an in-memory store behind the node protocol.
//!
//! Run one per terminal, then point a cache at them:
//!   RUST_LOG=info cargo run --example node-server -- 7001
//!   RUST_LOG=info cargo run --example node-server -- 7002
//!   RUST_LOG=info cargo run --example node-server -- 7003

use ringcache::{MemoryNode, NodeServer};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let port: u16 = env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(7001);
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    let store = Arc::new(MemoryNode::new(format!("127.0.0.1:{}", port)));
    let server = NodeServer::for_memory_node(addr, store).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
