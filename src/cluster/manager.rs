//! Connections to backing nodes, with retries and health checks.

use crate::cluster::events::{ClusterEvent, ClusterEventListener, LoggingEventListener};
use crate::cluster::health::{HealthTable, HealthTransition, NodeHealth};
use crate::cluster::retry::RetryPolicy;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::storage::{SharedClient, WriteEntry};
use crate::types::{NodeId, StoredEntry};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the cluster event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Owns one client per backing node and routes calls to them.
///
/// Every call is bounded by the configured timeout and retried with
/// backoff when the failure is transient. Health checks ping each node
/// concurrently and publish [`ClusterEvent`]s on a broadcast channel.
pub struct ClusterManager {
    /// Clients by node id.
    clients: RwLock<HashMap<NodeId, SharedClient>>,

    /// Last observed health per node.
    health: RwLock<HealthTable>,

    /// Event publisher.
    events: broadcast::Sender<ClusterEvent>,

    /// Logs every event.
    listener: Box<dyn ClusterEventListener>,

    /// Retry policy for data calls.
    retry: RetryPolicy,

    /// Cluster settings.
    config: ClusterConfig,

    /// Set once shutdown has begun.
    closed: AtomicBool,
}

impl ClusterManager {
    /// Create a manager with no nodes.
    pub fn new(config: ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clients: RwLock::new(HashMap::new()),
            health: RwLock::new(HealthTable::new()),
            events,
            listener: Box::new(LoggingEventListener),
            retry: RetryPolicy::from_config(&config),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a node. Replaces any previous client for the same id.
    pub fn add_node(&self, node_id: NodeId, client: SharedClient) {
        self.clients.write().insert(node_id.clone(), client);
        self.health.write().insert(node_id.clone());
        self.emit(ClusterEvent::NodeAdded { node_id });
    }

    /// Unregister a node and close its client.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        let client = self
            .clients
            .write()
            .remove(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        self.health.write().remove(node_id);

        client.close().await;
        self.emit(ClusterEvent::NodeRemoved {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// Whether the node is registered.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.clients.read().contains_key(node_id)
    }

    /// Registered node ids, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.clients.read().len()
    }

    /// The client for a node.
    pub fn client(&self, node_id: &str) -> Result<SharedClient> {
        self.clients
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Cluster settings.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn emit(&self, event: ClusterEvent) {
        self.listener.on_event(&event);
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Run `f` against a node's client under the retry policy.
    async fn call<T, F, Fut>(&self, node_id: &str, operation: &str, f: F) -> Result<T>
    where
        F: Fn(SharedClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        let client = self.client(node_id)?;
        self.retry.run(operation, node_id, || f(client.clone())).await
    }

    /// Read a value from a node.
    pub async fn get(&self, node_id: &str, key: &str) -> Result<Option<Bytes>> {
        self.call(node_id, "get", |c| async move { c.get(key).await })
            .await
    }

    /// Read a value and its remaining TTL from a node.
    pub async fn get_with_ttl(&self, node_id: &str, key: &str) -> Result<Option<StoredEntry>> {
        self.call(node_id, "get_with_ttl", |c| async move {
            c.get_with_ttl(key).await
        })
        .await
    }

    /// Write a value to a node.
    pub async fn set(&self, node_id: &str, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.call(node_id, "set", |c| {
            let value = value.clone();
            async move { c.set(key, value, ttl).await }
        })
        .await
    }

    /// Delete a key on a node.
    pub async fn del(&self, node_id: &str, key: &str) -> Result<bool> {
        self.call(node_id, "del", |c| async move { c.del(key).await })
            .await
    }

    /// Set a TTL on a key on a node.
    pub async fn expire(&self, node_id: &str, key: &str, ttl: Duration) -> Result<bool> {
        self.call(node_id, "expire", |c| async move { c.expire(key, ttl).await })
            .await
    }

    /// Read several keys from a node in one batch.
    pub async fn mget(&self, node_id: &str, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.call(node_id, "mget", |c| async move { c.mget(keys).await })
            .await
    }

    /// Write several entries to a node in one batch.
    pub async fn mset(&self, node_id: &str, entries: Vec<WriteEntry>) -> Result<()> {
        self.call(node_id, "mset", |c| {
            let entries = entries.clone();
            async move { c.mset(entries).await }
        })
        .await
    }

    /// List keys with a prefix on a node.
    pub async fn keys(&self, node_id: &str, prefix: &str) -> Result<Vec<String>> {
        self.call(node_id, "keys", |c| async move { c.keys(prefix).await })
            .await
    }

    /// Ping every node concurrently and update health.
    ///
    /// Emits [`ClusterEvent::NodeError`] for every failed ping and
    /// [`ClusterEvent::NodeRecovered`] when an unhealthy node answers again.
    pub async fn check_health(&self) -> BTreeMap<NodeId, bool> {
        let clients: Vec<(NodeId, SharedClient)> = self
            .clients
            .read()
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();

        let timeout = self.config.op_timeout;
        let mut pings = JoinSet::new();
        for (node_id, client) in clients {
            pings.spawn(async move {
                let result = match tokio::time::timeout(timeout, client.ping()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };
                (node_id, result)
            });
        }

        while let Some(joined) = pings.join_next().await {
            let Ok((node_id, result)) = joined else {
                continue;
            };

            // Skip nodes removed while the ping was in flight.
            if !self.contains_node(&node_id) {
                continue;
            }

            match result {
                Ok(()) => {
                    let transition = self.health.write().record_success(&node_id);
                    if transition == HealthTransition::Recovered {
                        self.emit(ClusterEvent::NodeRecovered { node_id });
                    }
                }
                Err(e) => {
                    self.health.write().record_failure(&node_id, e.to_string());
                    self.emit(ClusterEvent::NodeError {
                        node_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.health_snapshot()
    }

    /// Run [`check_health`](Self::check_health) every interval until cancelled.
    pub async fn run_health_checks(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval = ?self.config.health_check_interval, "Health checks started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_health().await;
                }
                _ = token.cancelled() => {
                    debug!("Health checks stopped");
                    break;
                }
            }
        }
    }

    /// `NodeId -> healthy` for every node.
    pub fn health_snapshot(&self) -> BTreeMap<NodeId, bool> {
        self.health.read().snapshot()
    }

    /// Whether the node answered its last ping.
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.health.read().is_healthy(node_id)
    }

    /// Detailed health of a node.
    pub fn node_health(&self, node_id: &str) -> Option<NodeHealth> {
        self.health.read().get(node_id)
    }

    /// Number of healthy nodes.
    pub fn healthy_count(&self) -> usize {
        self.health.read().healthy_count()
    }

    /// Close every client. Later calls fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let clients: Vec<SharedClient> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close().await;
        }
        info!(closed = clients.len(), "Cluster connections closed");
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("nodes", &self.node_ids())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryNode, NodeClient};

    fn fast_config() -> ClusterConfig {
        ClusterConfig::default()
            .with_op_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn manager_with(nodes: &[&str]) -> (ClusterManager, Vec<Arc<MemoryNode>>) {
        let manager = ClusterManager::new(fast_config());
        let mut handles = Vec::new();
        for id in nodes {
            let node = Arc::new(MemoryNode::new(*id));
            manager.add_node(id.to_string(), node.clone());
            handles.push(node);
        }
        (manager, handles)
    }

    #[tokio::test]
    async fn test_routes_to_named_node() {
        let (manager, nodes) = manager_with(&["a", "b"]);

        manager.set("a", "k", Bytes::from("v"), None).await.unwrap();

        assert_eq!(manager.get("a", "k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(manager.get("b", "k").await.unwrap(), None);
        assert_eq!(nodes[0].peek("k").await, Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_batched_writes_reach_one_node() {
        let (manager, nodes) = manager_with(&["a", "b"]);

        manager
            .mset(
                "b",
                vec![
                    WriteEntry::new("x", "1", None),
                    WriteEntry::new("y", "2", Some(Duration::from_secs(30))),
                ],
            )
            .await
            .unwrap();

        let values = manager
            .mget("b", &["x".to_string(), "y".to_string(), "z".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(Bytes::from("1")), Some(Bytes::from("2")), None]);
        assert_eq!(nodes[0].data_key_count(), 0);
        assert!(manager.get_with_ttl("b", "y").await.unwrap().unwrap().ttl_ms.is_some());

        nodes[1].set_available(false);
        assert!(manager.mset("b", vec![WriteEntry::new("w", "3", None)]).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let (manager, _) = manager_with(&["a"]);
        let err = manager.get("zzz", "k").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (manager, nodes) = manager_with(&["a"]);
        nodes[0].set_available(false);

        let before = nodes[0].call_count();
        assert!(manager.get("a", "k").await.is_err());
        assert_eq!(nodes[0].call_count() - before, 3);
    }

    #[tokio::test]
    async fn test_health_events() {
        let (manager, nodes) = manager_with(&["a", "b"]);
        let mut events = manager.subscribe();

        nodes[1].set_available(false);
        let health = manager.check_health().await;
        assert_eq!(health.get("a"), Some(&true));
        assert_eq!(health.get("b"), Some(&false));
        assert_eq!(manager.healthy_count(), 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ClusterEvent::NodeError { ref node_id, .. } if node_id == "b"));

        nodes[1].set_available(true);
        manager.check_health().await;
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ClusterEvent::NodeRecovered {
                node_id: "b".to_string()
            }
        );
        assert!(manager.is_healthy("b"));
        // Unhealthy nodes were never removed.
        assert_eq!(manager.node_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_node() {
        let (manager, _) = manager_with(&["a", "b"]);
        manager.remove_node("a").await.unwrap();

        assert_eq!(manager.node_ids(), vec!["b".to_string()]);
        assert!(manager.remove_node("a").await.is_err());
        assert!(!manager.health_snapshot().contains_key("a"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (manager, nodes) = manager_with(&["a"]);

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(matches!(manager.get("a", "k").await, Err(Error::ShuttingDown)));
        assert!(nodes[0].ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_background_health_checks_stop_on_cancel() {
        let config = fast_config().with_health_check_interval(Duration::from_millis(10));
        let manager = Arc::new(ClusterManager::new(config));
        let node = Arc::new(MemoryNode::new("a"));
        manager.add_node("a".into(), node.clone());

        let token = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().run_health_checks(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.call_count() >= 2);

        token.cancel();
        handle.await.unwrap();
    }
}
