//! The replicated cache service.

use crate::cluster::{ClusterEvent, ClusterManager};
use crate::config::{CacheConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::network::TcpConnector;
use crate::partitioning::{HashNode, HashRing};
use crate::replication::{RebalanceReport, ReplicationManager};
use crate::storage::{NodeConnector, WriteEntry};
use crate::sync::{Clock, Mutation, ReplicaPlacement, SyncCoordinator, SyncNotification, SyncReport, SystemClock};
use crate::types::{HealthStatus, NodeId, Stats, SYNC_EVENT_PREFIX};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Upper bound on draining pending work during shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The main cache instance.
///
/// Keys are placed on backing nodes with a weighted consistent hash ring
/// and replicated under the configured consistency level. Values are
/// JSON-serialized. Every accepted mutation is recorded as a sync event,
/// and a background task reconciles replicas that diverged.
///
/// Background health checks and anti-entropy run until
/// [`shutdown`](Self::shutdown) is called or the service is dropped.
pub struct DistributedCacheService {
    /// Configuration.
    config: CacheConfig,

    /// Creates clients for nodes added at runtime.
    connector: Arc<dyn NodeConnector>,

    /// Backing-node connections.
    cluster: Arc<ClusterManager>,

    /// Ring and consistency levels.
    replication: Arc<ReplicationManager>,

    /// Anti-entropy.
    sync: Arc<SyncCoordinator>,

    /// Shared counters.
    metrics: Arc<CacheMetrics>,

    /// Stops background tasks.
    shutdown: CancellationToken,

    /// Background tasks.
    tasks: TaskTracker,

    /// Set once shutdown has begun.
    closed: AtomicBool,
}

impl DistributedCacheService {
    /// Create a service talking to backing nodes over TCP.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(config.cluster.connect_timeout));
        Self::with_connector(config, connector).await
    }

    /// Create a service with a custom connector.
    pub async fn with_connector(config: CacheConfig, connector: Arc<dyn NodeConnector>) -> Result<Self> {
        Self::with_clock(config, connector, Arc::new(SystemClock)).await
    }

    /// Create a service whose sync events are stamped by `clock`.
    pub async fn with_clock(
        config: CacheConfig,
        connector: Arc<dyn NodeConnector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            node_id = %config.node_id,
            nodes = config.nodes.len(),
            factor = config.replication.factor,
            consistency = %config.replication.consistency,
            "Starting cache service"
        );

        let metrics = Arc::new(CacheMetrics::new());
        let cluster = Arc::new(ClusterManager::new(config.cluster.clone()));
        for node in &config.nodes {
            let client = connector.connect(node)?;
            cluster.add_node(node.id(), client);
        }

        let ring = HashRing::from_nodes(config.hash_nodes(), config.base_vnodes);
        let replication = Arc::new(ReplicationManager::new(
            ring,
            cluster.clone(),
            config.replication.clone(),
            metrics.clone(),
        ));

        let placement: Arc<dyn ReplicaPlacement> = replication.clone();
        let sync = Arc::new(SyncCoordinator::new(
            config.node_id.clone(),
            cluster.clone(),
            placement,
            config.sync.clone(),
            clock,
            metrics.clone(),
        ));

        // A restarted process must not reuse its predecessor's clock values.
        sync.restore_clocks().await;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(cluster.clone().run_health_checks(shutdown.child_token()));
        tasks.spawn(
            sync.clone()
                .run(config.replication.sync_interval, shutdown.child_token()),
        );

        Ok(Self {
            config,
            connector,
            cluster,
            replication,
            sync,
            metrics,
            shutdown,
            tasks,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Record a sync event if at least one replica accepted the mutation.
    fn record(&self, outcome: &Result<usize>, mutation: Mutation) {
        let accepted = match outcome {
            Ok(acks) => *acks > 0,
            Err(Error::QuorumNotReached { achieved, .. }) => *achieved > 0,
            Err(_) => false,
        };
        if !accepted {
            return;
        }

        if let Err(e) = self.sync.record_event(mutation) {
            warn!(error = %e, "Failed to record sync event");
        }
    }

    // ==================== Data ====================

    /// Read and deserialize a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.ensure_open()?;
        validate_key(key)?;

        let value = self.replication.get(key).await?;
        self.metrics.record_get(value.is_some());
        decode(value)
    }

    /// Serialize and store a value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let data = encode(value)?;

        self.metrics.set_total.inc();
        let _lock = self.sync.key_locks().shared(key).await;
        let outcome = self.replication.set(key, data.clone(), ttl).await;
        self.record(
            &outcome,
            Mutation::Set {
                key: key.to_string(),
                value: data,
                ttl,
            },
        );
        outcome.map(|_| ())
    }

    /// Delete a key.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;

        self.metrics.delete_total.inc();
        let _lock = self.sync.key_locks().shared(key).await;
        let outcome = self.replication.del(key).await;
        self.record(&outcome, Mutation::Delete { key: key.to_string() });
        outcome.map(|_| ())
    }

    /// Set a TTL on a key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;

        self.metrics.expire_total.inc();
        let _lock = self.sync.key_locks().shared(key).await;
        let outcome = self.replication.expire(key, ttl).await;
        self.record(
            &outcome,
            Mutation::Expire {
                key: key.to_string(),
                ttl,
            },
        );
        outcome.map(|_| ())
    }

    /// Read several keys concurrently. Results are in input order.
    ///
    /// Fails with the first error if any read fails.
    pub async fn mget<T, K>(&self, keys: &[K]) -> Result<Vec<Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        self.ensure_open()?;
        for key in keys {
            validate_key(key.as_ref())?;
        }

        let mut reads = JoinSet::new();
        for (index, key) in keys.iter().enumerate() {
            let replication = self.replication.clone();
            let key = key.as_ref().to_string();
            reads.spawn(async move { (index, replication.get(&key).await) });
        }

        let mut values: Vec<Option<Bytes>> = vec![None; keys.len()];
        let mut first_error = None;
        while let Some(joined) = reads.join_next().await {
            let (index, result) = joined.map_err(|e| Error::Internal(e.to_string()))?;
            match result {
                Ok(value) => {
                    self.metrics.record_get(value.is_some());
                    values[index] = value;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        values.into_iter().map(decode::<T>).collect()
    }

    /// Store several values with a shared TTL, one batch per backing node.
    ///
    /// Every entry is attempted and judged on its own replicas; the first
    /// error is returned.
    pub async fn mset<T, K>(&self, entries: &[(K, T)], ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize,
        K: AsRef<str>,
    {
        self.ensure_open()?;
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            validate_key(key.as_ref())?;
            encoded.push(WriteEntry::new(key.as_ref(), encode(value)?, ttl));
        }
        self.metrics.set_total.inc_by(encoded.len() as u64);

        let _locks = self
            .sync
            .key_locks()
            .shared_many(encoded.iter().map(|entry| entry.key.as_str()))
            .await;

        let mut first_error = None;
        for (entry, outcome) in self.replication.mset(encoded).await {
            self.record(
                &outcome,
                Mutation::Set {
                    key: entry.key,
                    value: entry.value,
                    ttl: entry.ttl,
                },
            );
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ==================== Cluster ====================

    /// Add a backing node and move keys to it.
    pub async fn add_node(&self, node: NodeConfig) -> Result<RebalanceReport> {
        self.ensure_open()?;
        node.validate()?;

        let client = self.connector.connect(&node)?;
        let report = self
            .replication
            .add_node(HashNode::new(node.id(), node.weight), client)
            .await?;
        info!(node_id = %node.id(), moved = report.keys_moved, "Node added");
        Ok(report)
    }

    /// Move keys off a backing node and remove it.
    pub async fn remove_node(&self, node_id: &str) -> Result<RebalanceReport> {
        self.ensure_open()?;

        let report = self.replication.remove_node(node_id).await?;
        info!(node_id, moved = report.keys_moved, "Node removed");
        Ok(report)
    }

    /// Replica set of a key, primary first.
    pub async fn replicas(&self, key: &str) -> Result<Vec<NodeId>> {
        self.replication.replicas(key).await
    }

    /// Run an anti-entropy pass now. `None` if one is already running.
    pub async fn synchronize(&self) -> Result<Option<SyncReport>> {
        self.ensure_open()?;
        self.sync.synchronize().await
    }

    /// Delete sync events past their retention. Returns the deletions.
    pub async fn cleanup_events(&self) -> Result<usize> {
        self.ensure_open()?;
        self.sync.cleanup_events().await
    }

    /// Ping every node now instead of waiting for the next interval.
    pub async fn check_health(&self) -> Result<HealthStatus> {
        self.ensure_open()?;
        self.cluster.check_health().await;
        Ok(self.health_status())
    }

    /// Wait for pending secondary writes and event broadcasts.
    pub async fn flush(&self) {
        self.replication.flush().await;
        self.sync.flush().await;
    }

    // ==================== Status ====================

    /// Node health and sync status.
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            cluster: self.cluster.health_snapshot(),
            sync: self.sync.status(),
            node_id: self.config.node_id.clone(),
        }
    }

    /// Cluster statistics.
    pub async fn stats(&self) -> Stats {
        Stats {
            total_nodes: self.replication.node_count().await,
            healthy_nodes: self.cluster.healthy_count(),
            replication_factor: self.config.replication.factor,
            consistency: self.config.replication.consistency,
        }
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Counters in Prometheus exposition format.
    pub fn prometheus_metrics(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Subscribe to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sync.subscribe()
    }

    /// Subscribe to backing-node events.
    pub fn subscribe_cluster(&self) -> broadcast::Receiver<ClusterEvent> {
        self.cluster.subscribe()
    }

    /// This process's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ==================== Lifecycle ====================

    /// Stop background tasks, drain pending work and close connections.
    ///
    /// Idempotent. Every later operation fails with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = %self.config.node_id, "Shutting down cache service");

        self.shutdown.cancel();
        self.tasks.close();

        let drain = async {
            self.tasks.wait().await;
            self.flush().await;
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(timeout = ?SHUTDOWN_DRAIN_TIMEOUT, "Timed out draining pending work");
        }

        self.cluster.shutdown().await;
        debug!("Cache service stopped");
    }
}

impl Drop for DistributedCacheService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for DistributedCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCacheService")
            .field("node_id", &self.config.node_id)
            .field("consistency", &self.config.replication.consistency)
            .field("closed", &self.is_shutdown())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".into()));
    }
    if key.starts_with(SYNC_EVENT_PREFIX) {
        return Err(Error::InvalidKey(format!(
            "{} uses the reserved prefix {}",
            key, SYNC_EVENT_PREFIX
        )));
    }
    Ok(())
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(value: Option<Bytes>) -> Result<Option<T>> {
    value
        .map(|data| serde_json::from_slice(&data).map_err(Error::from))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::replication::ConsistencyLevel;
    use crate::storage::MemoryConnector;
    use std::collections::BTreeMap;

    async fn service(consistency: ConsistencyLevel) -> (DistributedCacheService, MemoryConnector) {
        let connector = MemoryConnector::new();
        let config = CacheConfig::new(
            "app-1",
            vec![
                NodeConfig::new("10.0.0.1", 6379),
                NodeConfig::new("10.0.0.2", 6379),
                NodeConfig::new("10.0.0.3", 6379),
            ],
        )
        .with_replication_factor(3)
        .with_consistency(consistency)
        .with_sync_config(SyncConfig::default().with_sync_on_event(false));

        let cache = DistributedCacheService::with_connector(config, Arc::new(connector.clone()))
            .await
            .unwrap();
        (cache, connector)
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let (cache, _) = service(ConsistencyLevel::Strong).await;

        let mut profile = BTreeMap::new();
        profile.insert("name".to_string(), "Alice".to_string());
        cache.set("user:1", &profile, None).await.unwrap();

        let read: Option<BTreeMap<String, String>> = cache.get("user:1").await.unwrap();
        assert_eq!(read, Some(profile));

        let missing: Option<String> = cache.get("user:2").await.unwrap();
        assert_eq!(missing, None);

        let snapshot = cache.metrics();
        assert_eq!(snapshot.get_hits, 1);
        assert_eq!(snapshot.get_misses, 1);
        assert_eq!(snapshot.events_recorded, 1);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_values_are_json_on_backing_nodes() {
        let (cache, connector) = service(ConsistencyLevel::Strong).await;

        cache.set("n", &42u32, None).await.unwrap();
        for id in connector.node_ids() {
            assert_eq!(connector.node(&id).peek("n").await, Some(Bytes::from("42")));
        }

        // A type mismatch surfaces as a serialization error.
        let result: Result<Option<Vec<String>>> = cache.get("n").await;
        assert!(matches!(result, Err(Error::Serialization(_))));

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_keys_and_values() {
        let (cache, connector) = service(ConsistencyLevel::Strong).await;

        assert!(matches!(cache.set("", &1, None).await, Err(Error::InvalidKey(_))));
        let reserved = format!("{}123:x:1", SYNC_EVENT_PREFIX);
        assert!(matches!(cache.get::<u32>(&reserved).await, Err(Error::InvalidKey(_))));
        assert!(matches!(cache.del(&reserved).await, Err(Error::InvalidKey(_))));

        // Maps with non-string keys cannot be JSON-encoded.
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1u32);
        assert!(matches!(cache.set("bad", &bad, None).await, Err(Error::Serialization(_))));

        // Nothing reached the backing nodes.
        for id in connector.node_ids() {
            assert_eq!(connector.node(&id).data_key_count(), 0);
        }
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_mget_and_mset_preserve_order() {
        let (cache, _) = service(ConsistencyLevel::Quorum).await;

        let entries: Vec<(String, u64)> = (0..20).map(|i| (format!("k{}", i), i * 10)).collect();
        cache.mset(&entries, None).await.unwrap();

        let keys = ["k3", "missing", "k19", "k0"];
        let values: Vec<Option<u64>> = cache.mget(&keys).await.unwrap();
        assert_eq!(values, vec![Some(30), None, Some(190), Some(0)]);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_expire_and_del() {
        let (cache, _) = service(ConsistencyLevel::Quorum).await;

        cache.set("session", "token", None).await.unwrap();
        cache.expire("session", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get::<String>("session").await.unwrap(), None);

        cache.set("doomed", "x", None).await.unwrap();
        cache.del("doomed").await.unwrap();
        assert_eq!(cache.get::<String>("doomed").await.unwrap(), None);

        let snapshot = cache.metrics();
        assert_eq!(snapshot.expire_total, 1);
        assert_eq!(snapshot.delete_total, 1);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (cache, _) = service(ConsistencyLevel::Eventual).await;

        let stats = cache.stats().await;
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.replication_factor, 3);
        assert_eq!(stats.consistency, ConsistencyLevel::Eventual);

        let health = cache.check_health().await.unwrap();
        assert_eq!(health.node_id, "app-1");
        assert_eq!(health.cluster.len(), 3);
        assert!(health.all_healthy());

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CacheConfig::new("app-1", vec![NodeConfig::new("10.0.0.1", 6379)]).with_replication_factor(2);
        let result = DistributedCacheService::with_connector(config, Arc::new(MemoryConnector::new())).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (cache, _) = service(ConsistencyLevel::Strong).await;
        cache.set("k", &1, None).await.unwrap();

        cache.shutdown().await;
        cache.shutdown().await;
        assert!(cache.is_shutdown());

        assert!(matches!(cache.get::<u32>("k").await, Err(Error::ShuttingDown)));
        assert!(matches!(cache.set("k", &2, None).await, Err(Error::ShuttingDown)));
        assert!(matches!(cache.synchronize().await, Err(Error::ShuttingDown)));
        assert!(matches!(
            cache.add_node(NodeConfig::new("10.0.0.9", 6379)).await,
            Err(Error::ShuttingDown)
        ));
    }
}
