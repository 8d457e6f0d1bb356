//! Randomized failure injection across the nodes of a test cluster.
//!
//! The controller drives [`MemoryNode`]'s own fault knobs: availability,
//! transient failure rate and latency.

use crate::storage::{MemoryNode, NodeClient};
use crate::types::NodeId;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for chaos testing.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Per-call probability of a transient error on every node (0.0 - 1.0).
    pub failure_rate: f64,

    /// Probability that a step adds latency to a node (0.0 - 1.0).
    pub latency_probability: f64,

    /// Minimum injected latency.
    pub latency_min: Duration,

    /// Maximum injected latency.
    pub latency_max: Duration,

    /// Probability that a step crashes a node (0.0 - 1.0).
    pub crash_probability: f64,

    /// Minimum crash duration.
    pub crash_min_duration: Duration,

    /// Maximum crash duration.
    pub crash_max_duration: Duration,

    /// Crashes lose the node's data when set.
    pub crash_loses_data: bool,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency_probability: 0.0,
            latency_min: Duration::from_millis(1),
            latency_max: Duration::from_millis(20),
            crash_probability: 0.0,
            crash_min_duration: Duration::from_millis(50),
            crash_max_duration: Duration::from_millis(500),
            crash_loses_data: false,
        }
    }
}

impl ChaosConfig {
    /// Create a config for light chaos testing.
    pub fn light() -> Self {
        Self {
            failure_rate: 0.01,
            latency_probability: 0.05,
            crash_probability: 0.01,
            ..Default::default()
        }
    }

    /// Create a config for moderate chaos testing.
    pub fn moderate() -> Self {
        Self {
            failure_rate: 0.05,
            latency_probability: 0.1,
            crash_probability: 0.05,
            ..Default::default()
        }
    }

    /// Disable all chaos.
    pub fn none() -> Self {
        Self::default()
    }
}

/// A node taken down by the controller.
#[derive(Debug, Clone)]
struct NodeCrash {
    recovers_at: Instant,
    loses_data: bool,
}

/// Chaos controller for injecting failures.
#[derive(Debug)]
pub struct ChaosController {
    /// Configuration.
    config: ChaosConfig,

    /// Whether chaos is enabled.
    enabled: AtomicBool,

    /// Nodes under control.
    nodes: RwLock<BTreeMap<NodeId, Arc<MemoryNode>>>,

    /// Active crashes.
    crashes: RwLock<HashMap<NodeId, NodeCrash>>,

    /// Statistics: steps taken.
    steps: AtomicU64,

    /// Statistics: crashes triggered.
    crashes_triggered: AtomicU64,

    /// Statistics: latency injections.
    latencies_injected: AtomicU64,
}

impl ChaosController {
    /// Create a new chaos controller.
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            config,
            enabled: AtomicBool::new(false),
            nodes: RwLock::new(BTreeMap::new()),
            crashes: RwLock::new(HashMap::new()),
            steps: AtomicU64::new(0),
            crashes_triggered: AtomicU64::new(0),
            latencies_injected: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults() -> Self {
        Self::new(ChaosConfig::default())
    }

    /// Enable chaos injection and apply the configured failure rate.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        for node in self.nodes.read().values() {
            node.set_failure_rate(self.config.failure_rate);
        }
    }

    /// Disable chaos injection and heal every node.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.reset();
    }

    /// Check if chaos is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Register a node with the controller.
    pub fn register_node(&self, node: Arc<MemoryNode>) {
        self.nodes.write().insert(node.node_id().to_string(), node);
    }

    /// Check if a node is crashed.
    pub fn is_crashed(&self, node_id: &str) -> bool {
        self.crashes.read().contains_key(node_id)
    }

    /// Manually crash a node until the step after `duration`.
    pub fn crash_node(&self, node_id: &str, duration: Duration, loses_data: bool) {
        let Some(node) = self.nodes.read().get(node_id).cloned() else {
            return;
        };
        node.set_available(false);

        self.crashes.write().insert(
            node_id.to_string(),
            NodeCrash {
                recovers_at: Instant::now() + duration,
                loses_data,
            },
        );
        self.crashes_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Bring crashed nodes back online: all of them, or those due by `now`.
    fn recover_due(&self, now: Option<Instant>) {
        let due: Vec<(NodeId, NodeCrash)> = {
            let mut crashes = self.crashes.write();
            let ids: Vec<NodeId> = crashes
                .iter()
                .filter(|(_, c)| now.map_or(true, |now| c.recovers_at <= now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| crashes.remove(&id).map(|c| (id, c)))
                .collect()
        };

        let nodes = self.nodes.read();
        for (id, crash) in due {
            if let Some(node) = nodes.get(&id) {
                if crash.loses_data {
                    node.restart();
                } else {
                    node.set_available(true);
                }
            }
        }
    }

    /// Recover all crashed nodes immediately.
    pub fn recover_all_nodes(&self) {
        self.recover_due(None);
    }

    /// Reset all chaos state.
    pub fn reset(&self) {
        self.recover_all_nodes();
        for node in self.nodes.read().values() {
            node.set_failure_rate(0.0);
            node.set_latency(Duration::ZERO);
        }
    }

    /// Recover due nodes, then maybe crash or slow down random nodes.
    ///
    /// Never crashes the last node still up.
    pub fn step(&self) {
        if !self.is_enabled() {
            return;
        }
        self.steps.fetch_add(1, Ordering::Relaxed);
        self.recover_due(Some(Instant::now()));

        let mut rng = rand::rng();
        let nodes: Vec<(NodeId, Arc<MemoryNode>)> = self
            .nodes
            .read()
            .iter()
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect();

        for (id, node) in &nodes {
            if rng.random::<f64>() < self.config.latency_probability {
                let min_ms = self.config.latency_min.as_millis() as u64;
                let max_ms = self.config.latency_max.as_millis() as u64;
                node.set_latency(Duration::from_millis(rng.random_range(min_ms..=max_ms)));
                self.latencies_injected.fetch_add(1, Ordering::Relaxed);
            } else {
                node.set_latency(Duration::ZERO);
            }

            let up = nodes.len() - self.crashes.read().len();
            if up > 1 && !self.is_crashed(id) && rng.random::<f64>() < self.config.crash_probability {
                let min_ms = self.config.crash_min_duration.as_millis() as u64;
                let max_ms = self.config.crash_max_duration.as_millis() as u64;
                let duration = Duration::from_millis(rng.random_range(min_ms..=max_ms));
                self.crash_node(id, duration, self.config.crash_loses_data);
            }
        }
    }

    /// Get chaos statistics.
    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            enabled: self.is_enabled(),
            steps: self.steps.load(Ordering::Relaxed),
            crashes_triggered: self.crashes_triggered.load(Ordering::Relaxed),
            active_crashes: self.crashes.read().len(),
            latencies_injected: self.latencies_injected.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChaosController {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Chaos testing statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Whether chaos is enabled.
    pub enabled: bool,

    /// Steps taken.
    pub steps: u64,

    /// Crashes triggered.
    pub crashes_triggered: u64,

    /// Nodes currently down.
    pub active_crashes: usize,

    /// Latency injections.
    pub latencies_injected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DistributedCacheService;
    use crate::replication::ConsistencyLevel;
    use crate::testing::TestCluster;

    fn controller(cluster: &TestCluster, config: ChaosConfig) -> ChaosController {
        let chaos = ChaosController::new(config);
        for id in cluster.node_ids() {
            chaos.register_node(cluster.node(&id));
        }
        chaos
    }

    #[test]
    fn test_disabled_controller_does_nothing() {
        let cluster = TestCluster::new(3);
        let chaos = controller(
            &cluster,
            ChaosConfig {
                crash_probability: 1.0,
                ..Default::default()
            },
        );

        chaos.step();
        assert_eq!(chaos.stats(), ChaosStats::default());
        assert!(cluster.node("node-1").is_available());
    }

    #[test]
    fn test_crash_and_recover() {
        let cluster = TestCluster::new(3);
        let chaos = controller(&cluster, ChaosConfig::none());
        chaos.enable();

        chaos.crash_node("node-2", Duration::from_secs(60), false);
        assert!(chaos.is_crashed("node-2"));
        assert!(!cluster.node("node-2").is_available());

        chaos.step();
        assert!(chaos.is_crashed("node-2"));

        chaos.recover_all_nodes();
        assert!(!chaos.is_crashed("node-2"));
        assert!(cluster.node("node-2").is_available());
    }

    #[test]
    fn test_never_crashes_every_node() {
        let cluster = TestCluster::new(3);
        let chaos = controller(
            &cluster,
            ChaosConfig {
                crash_probability: 1.0,
                crash_min_duration: Duration::from_secs(60),
                crash_max_duration: Duration::from_secs(60),
                ..Default::default()
            },
        );
        chaos.enable();

        for _ in 0..5 {
            chaos.step();
        }
        assert_eq!(chaos.stats().active_crashes, 2);
        assert_eq!(
            cluster
                .node_ids()
                .iter()
                .filter(|id| cluster.node(id).is_available())
                .count(),
            1
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_quorum_survives_light_chaos() {
        let cluster = TestCluster::new(5);
        let cache: DistributedCacheService = cluster
            .start(cluster.config("app-1", 3, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        let chaos = controller(
            &cluster,
            ChaosConfig {
                failure_rate: 0.05,
                latency_probability: 0.2,
                ..Default::default()
            },
        );
        chaos.enable();

        // Retries absorb transient failures; a quorum of 3 tolerates one loss.
        let mut failures = 0;
        for i in 0..50 {
            chaos.step();
            if cache.set(&format!("k{}", i), &i, None).await.is_err() {
                failures += 1;
            }
        }
        assert!(failures <= 2, "too many failed writes: {}", failures);

        chaos.disable();
        for i in 0..50 {
            let key = format!("k{}", i);
            if let Some(value) = cache.get::<i32>(&key).await.unwrap() {
                assert_eq!(value, i);
            }
        }
        assert!(chaos.stats().steps >= 50);

        cache.shutdown().await;
    }
}
