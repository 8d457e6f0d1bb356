//! Basic example of using the replicated cache.
//!
//! Runs against three in-process memory nodes, so no servers are needed:
//!   RUST_LOG=info cargo run --example basic

use ringcache::{
    CacheConfig, ConsistencyLevel, DistributedCacheService, MemoryConnector, NodeConfig,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct User {
    name: String,
    visits: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "ringcache=debug,info".to_string()))
        .init();

    let nodes = (1..=3)
        .map(|i| NodeConfig::new("127.0.0.1", 7000 + i).with_id(format!("node-{}", i)))
        .collect();
    let config = CacheConfig::new("basic-demo", nodes)
        .with_replication_factor(3)
        .with_consistency(ConsistencyLevel::Quorum);

    let connector = MemoryConnector::new();
    let cache = DistributedCacheService::with_connector(config, Arc::new(connector.clone())).await?;
    println!("Cache started as {}", cache.node_id());

    // Typed values are stored as JSON
    println!("\n--- Writes ---");
    let alice = User {
        name: "Alice".to_string(),
        visits: 1,
    };
    cache.set("user:1", &alice, Some(Duration::from_secs(3600))).await?;
    cache.set("greeting", "hello", None).await?;
    println!("Replicas of user:1: {:?}", cache.replicas("user:1").await?);

    println!("\n--- Reads ---");
    let user: Option<User> = cache.get("user:1").await?;
    println!("user:1 = {:?}", user);
    let values: Vec<Option<String>> = cache.mget(&["greeting", "missing"]).await?;
    println!("mget = {:?}", values);

    // One node down: quorum still holds
    println!("\n--- Node failure ---");
    connector.node("node-2").set_available(false);
    cache.set("greeting", "still here", None).await?;
    let greeting: Option<String> = cache.get("greeting").await?;
    println!("greeting with node-2 down = {:?}", greeting);

    // Bring it back and let anti-entropy catch it up
    connector.node("node-2").set_available(true);
    cache.flush().await;
    if let Some(report) = cache.synchronize().await? {
        println!(
            "Sync pass: {} events, {} keys, {} repairs",
            report.events_collected, report.keys, report.repairs
        );
    }

    cache.expire("user:1", Duration::from_secs(60)).await?;
    cache.del("greeting").await?;

    let stats = cache.stats().await;
    println!("\nCluster stats:");
    println!("  Nodes: {} ({} healthy)", stats.total_nodes, stats.healthy_nodes);
    println!("  Replication factor: {}", stats.replication_factor);
    println!("  Consistency: {}", stats.consistency);

    let metrics = cache.metrics();
    println!("\nMetrics:");
    println!("  Gets: {} (hit rate {:.2})", metrics.get_total, metrics.hit_rate());
    println!("  Sets: {}", metrics.set_total);
    println!("  Events recorded: {}", metrics.events_recorded);

    // Shutdown
    println!("\nShutting down...");
    cache.shutdown().await;

    Ok(())
}
