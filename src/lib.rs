//! Replicated distributed cache over a consistent-hash ring.
//!
//! This crate provides a client-side cache layer that spreads keys over a
//! set of backing key-value nodes:
//! - **Weighted consistent hashing** with virtual nodes for placement
//! - **Replication** with strong, quorum or eventual consistency
//! - **Anti-entropy** that replays mutation events and repairs replicas
//!
//! # Features
//!
//! - N-way replication with per-operation acknowledgement thresholds
//! - Health checks, retries with backoff and per-call timeouts
//! - Conflict resolution by last-write-wins, version vectors or a custom resolver
//! - Live membership changes that move keys to their new owners
//! - In-memory backing nodes and a TCP node server for tests and demos
//!
//! # Example
//!
//! ```rust,no_run
//! use ringcache::{CacheConfig, ConsistencyLevel, DistributedCacheService, NodeConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let nodes = vec![
//!         NodeConfig::new("127.0.0.1", 7001),
//!         NodeConfig::new("127.0.0.1", 7002),
//!         NodeConfig::new("127.0.0.1", 7003),
//!     ];
//!     let config = CacheConfig::new("app-1", nodes)
//!         .with_replication_factor(3)
//!         .with_consistency(ConsistencyLevel::Quorum);
//!
//!     let cache = DistributedCacheService::new(config).await?;
//!
//!     // Writes need two of three replicas to acknowledge.
//!     cache.set("user:123", "Alice", Some(Duration::from_secs(3600))).await?;
//!
//!     let name: Option<String> = cache.get("user:123").await?;
//!     println!("Found: {:?}", name);
//!
//!     cache.del("user:123").await?;
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │         DistributedCacheService             │
//! │  • get / set / del / expire / mget / mset   │
//! │  • add_node / remove_node / synchronize     │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌────────────┐  ┌──────────────┐
//! │ HashRing │  │Replication │  │     Sync     │
//! │          │  │  Manager   │  │ Coordinator  │
//! └──────────┘  └────────────┘  └──────────────┘
//!                     │               │
//!                     ▼               ▼
//! ┌─────────────────────────────────────────────┐
//! │   ClusterManager (health, retry, timeout)   │
//! └─────────────────────────────────────────────┘
//!                     │
//!        node-1     node-2     node-3 ...
//! ```
//!
//! # Consistency Model
//!
//! - **Strong**: every replica must accept a write; any replica may answer a read
//! - **Quorum**: a majority of replicas must accept a write or agree on a read
//! - **Eventual**: the primary accepts synchronously, secondaries in the background
//!
//! Writes that miss their threshold are not rolled back. Every accepted
//! mutation is recorded as a sync event, and the next anti-entropy pass
//! brings lagging replicas in line.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod replication;
pub mod storage;
pub mod sync;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::DistributedCacheService;
pub use config::{CacheConfig, ClusterConfig, NodeConfig, ReplicationConfig, SyncConfig};
pub use error::{Error, NetworkError, Result};
pub use types::{HealthStatus, NodeId, Stats, StoredEntry, SyncStatus, SYNC_EVENT_PREFIX};

// Re-export cluster types
pub use cluster::{ClusterEvent, ClusterManager, NodeHealth, RetryPolicy};

// Re-export partitioning types
pub use partitioning::{HashNode, HashRing};

// Re-export replication types
pub use replication::{quorum_size, ConsistencyLevel, RebalanceReport, ReplicationManager};

// Re-export sync types
pub use sync::{
    Clock, ConflictResolver, ConflictStrategy, SyncCoordinator, SyncEvent, SyncEventKind,
    SyncNotification, SyncReport, VersionVector,
};

// Re-export storage and network types
pub use network::{NodeServer, TcpConnector};
pub use storage::{MemoryConnector, MemoryNode, NodeClient, NodeConnector};

// Re-export metrics types
pub use metrics::{CacheMetrics, MetricsSnapshot};

// Re-export testing types
pub use testing::{ChaosConfig, ChaosController, ChaosStats, TestCluster};
