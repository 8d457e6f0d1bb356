//! Replicated cache over TCP backing nodes, with a membership change.
//!
//! Starts four node servers in this process, builds a ring over the first
//! three, then adds the fourth and removes the first:
//!   RUST_LOG=info cargo run --example cluster

use ringcache::{
    CacheConfig, ConflictStrategy, ConsistencyLevel, DistributedCacheService, MemoryNode,
    NodeConfig, NodeServer,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct BackingNode {
    store: Arc<MemoryNode>,
    config: NodeConfig,
    shutdown: CancellationToken,
}

async fn start_node(id: &str) -> Result<BackingNode, Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryNode::new(id));
    let server = NodeServer::for_memory_node("127.0.0.1:0".parse()?, store.clone()).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());

    Ok(BackingNode {
        store,
        config: NodeConfig::new(addr.ip().to_string(), addr.port()).with_id(id),
        shutdown,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let mut backing = Vec::new();
    for i in 1..=4 {
        let node = start_node(&format!("node-{}", i)).await?;
        println!("{} listening on {}", node.config.id(), node.config.address());
        backing.push(node);
    }

    let config = CacheConfig::new(
        "cluster-demo",
        backing[..3].iter().map(|n| n.config.clone()).collect(),
    )
    .with_replication_factor(2)
    .with_consistency(ConsistencyLevel::Quorum)
    .with_sync_interval(Duration::from_secs(5))
    .with_conflict_strategy(ConflictStrategy::version_vector());

    let cache = DistributedCacheService::new(config).await?;

    println!("\n--- Loading 500 keys ---");
    let entries: Vec<(String, u32)> = (0..500).map(|i| (format!("item:{}", i), i)).collect();
    cache.mset(&entries, None).await?;
    print_distribution(&backing).await;

    println!("\n--- Adding node-4 with weight 2 ---");
    let report = cache.add_node(backing[3].config.clone().with_weight(2.0)).await?;
    println!(
        "Scanned {} keys, moved {}, {} copies, {} removals",
        report.keys_scanned, report.keys_moved, report.copies, report.removals
    );
    print_distribution(&backing).await;

    println!("\n--- Removing node-1 ---");
    let report = cache.remove_node("node-1").await?;
    println!("Moved {} keys off node-1", report.keys_moved);
    backing[0].shutdown.cancel();
    print_distribution(&backing).await;

    let item: Option<u32> = cache.get("item:42").await?;
    println!("\nitem:42 = {:?} on {:?}", item, cache.replicas("item:42").await?);

    let health = cache.check_health().await?;
    println!("\nHealth:");
    for (node_id, healthy) in &health.cluster {
        println!("  {}: {}", node_id, if *healthy { "up" } else { "down" });
    }

    println!("\n{}", cache.prometheus_metrics());

    cache.shutdown().await;
    for node in &backing {
        node.shutdown.cancel();
    }
    Ok(())
}

async fn print_distribution(backing: &[BackingNode]) {
    for node in backing {
        println!("  {}: {} keys", node.config.id(), node.store.data_key_count());
    }
}
