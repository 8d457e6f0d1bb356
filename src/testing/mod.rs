//! Testing utilities for the replicated cache.
//!
//! This module provides tools for exercising the cache against in-process
//! backing nodes:
//! - [`TestCluster`]: a set of [`MemoryNode`]s behind one connector, with
//!   kill, revive, restart and fault injection per node
//! - [`ChaosController`]: randomized failures across the whole cluster
//! - helpers that wait for eventually consistent state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Testing Framework                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ cache "app-a"│   │ cache "app-b"│   │ ...          │         │
//! │  └──────┬───────┘   └──────┬───────┘   └──────────────┘         │
//! │         └──────────┬───────┘                                    │
//! │                    ▼                                            │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │              TestCluster (MemoryConnector)                 │ │
//! │  │  node-1        node-2        node-3        ...             │ │
//! │  │  - kill / revive / restart (data loss)                     │ │
//! │  │  - failure rate, latency                                   │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use ringcache::replication::ConsistencyLevel;
//! use ringcache::testing::TestCluster;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ringcache::Result<()> {
//! let cluster = TestCluster::new(3);
//! let cache = cluster.start(cluster.config("app-1", 3, ConsistencyLevel::Quorum)).await?;
//!
//! cache.set("a", &1, None).await?;
//! cluster.kill("node-1");
//! assert_eq!(cache.get::<i32>("a").await?, Some(1));
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod chaos;
mod utils;

mod membership_tests;
mod scenario_tests;

pub use chaos::{ChaosConfig, ChaosController, ChaosStats};
pub use utils::{synchronize_now, wait_for, wait_for_result};

use crate::cache::DistributedCacheService;
use crate::config::{CacheConfig, ClusterConfig, NodeConfig, SyncConfig};
use crate::error::Result;
use crate::replication::ConsistencyLevel;
use crate::storage::{MemoryConnector, MemoryNode};
use crate::sync::Clock;
use crate::types::NodeId;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Base port of the synthetic node addresses.
const BASE_PORT: u16 = 7000;

/// A set of in-memory backing nodes shared by any number of caches.
#[derive(Debug, Clone)]
pub struct TestCluster {
    /// Hands out the nodes; caches started from this cluster share them.
    pub connector: MemoryConnector,

    /// Nodes forming the initial ring.
    pub nodes: Vec<NodeConfig>,

    /// When the cluster was created.
    pub started_at: Instant,
}

impl TestCluster {
    /// Create a cluster of `node_count` nodes named `node-1`, `node-2`, ...
    pub fn new(node_count: usize) -> Self {
        let connector = MemoryConnector::new();
        let nodes: Vec<NodeConfig> = (1..=node_count).map(Self::node_config).collect();
        for node in &nodes {
            connector.node(&node.id());
        }

        Self {
            connector,
            nodes,
            started_at: Instant::now(),
        }
    }

    /// Configuration of the `index`-th node (1-based), whether or not it is
    /// part of the initial ring.
    pub fn node_config(index: usize) -> NodeConfig {
        NodeConfig::new("127.0.0.1", BASE_PORT + index as u16).with_id(format!("node-{}", index))
    }

    /// A cache configuration over this cluster with test-friendly timings.
    ///
    /// Background passes are effectively disabled (one-hour interval, no
    /// event triggers); tests call `synchronize()` or shorten the interval.
    pub fn config(&self, process_id: &str, factor: usize, consistency: ConsistencyLevel) -> CacheConfig {
        CacheConfig::new(process_id, self.nodes.clone())
            .with_replication_factor(factor)
            .with_consistency(consistency)
            .with_sync_interval(Duration::from_secs(3600))
            .with_cluster_config(
                ClusterConfig::default()
                    .with_health_check_interval(Duration::from_millis(50))
                    .with_retry_attempts(2)
                    .with_op_timeout(Duration::from_millis(250))
                    .with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
            )
            .with_sync_config(SyncConfig::default().with_sync_on_event(false))
    }

    /// Start a cache over this cluster.
    pub async fn start(&self, config: CacheConfig) -> Result<DistributedCacheService> {
        DistributedCacheService::with_connector(config, Arc::new(self.connector.clone())).await
    }

    /// Start a cache whose events are stamped by `clock`.
    pub async fn start_with_clock(&self, config: CacheConfig, clock: Arc<dyn Clock>) -> Result<DistributedCacheService> {
        DistributedCacheService::with_clock(config, Arc::new(self.connector.clone()), clock).await
    }

    /// The node with this id.
    pub fn node(&self, id: &str) -> Arc<MemoryNode> {
        self.connector.node(id)
    }

    /// Ids of the initial ring members.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(NodeConfig::id).collect()
    }

    /// Take a node down. Its data survives.
    pub fn kill(&self, id: &str) {
        self.node(id).set_available(false);
    }

    /// Bring a killed node back with its data.
    pub fn revive(&self, id: &str) {
        self.node(id).set_available(true);
    }

    /// Restart a node: it comes back up empty.
    pub fn restart(&self, id: &str) {
        self.node(id).restart();
    }

    /// Fail a fraction of the node's calls with a transient error.
    pub fn set_failure_rate(&self, id: &str, rate: f64) {
        self.node(id).set_failure_rate(rate);
    }

    /// Delay every call to the node.
    pub fn set_latency(&self, id: &str, latency: Duration) {
        self.node(id).set_latency(latency);
    }

    /// Raw value of `key` on every node, bypassing availability.
    pub async fn replica_values(&self, key: &str) -> BTreeMap<NodeId, Option<Bytes>> {
        let mut values = BTreeMap::new();
        for id in self.connector.node_ids() {
            values.insert(id.clone(), self.node(&id).peek(key).await);
        }
        values
    }

    /// Raw value of `key` on one node.
    pub async fn peek(&self, id: &str, key: &str) -> Option<Bytes> {
        self.node(id).peek(key).await
    }

    /// Elapsed time since the cluster was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// JSON encoding of a value as it appears on backing nodes.
pub fn json<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    serde_json::to_vec(value).ok().map(Bytes::from)
}
