//! In-process backing node backed by Moka.
//!
//! `MemoryNode` plays the role of an external key-value server in tests,
//! demos and behind [`NodeServer`](crate::network::NodeServer). It supports
//! per-entry TTLs and can be taken down, restarted empty, or made to fail a
//! fraction of calls.

use crate::config::NodeConfig;
use crate::error::{Error, NetworkError, Result};
use crate::storage::{NodeClient, NodeConnector, WriteEntry};
use crate::types::{now_millis, NodeId, StoredEntry};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default capacity of a memory node.
pub const DEFAULT_NODE_CAPACITY: u64 = 1_000_000;

/// A stored value with its absolute expiration time.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    /// Expiration in milliseconds since the Unix epoch.
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|d| now_millis() + d.as_millis() as u64),
        }
    }

    fn remaining_ms(&self) -> Option<u64> {
        self.expires_at_ms.map(|at| at.saturating_sub(now_millis()))
    }

    fn is_expired(&self) -> bool {
        self.expires_at_ms.map_or(false, |at| at <= now_millis())
    }
}

/// Per-entry expiration policy for Moka.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.remaining_ms().map(Duration::from_millis)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining_ms().map(Duration::from_millis)
    }
}

/// Local key-value store standing in for a backing node.
pub struct MemoryNode {
    /// Node identifier.
    id: NodeId,

    /// The underlying Moka cache.
    cache: Cache<String, Entry>,

    /// Whether the node answers calls.
    available: AtomicBool,

    /// Probability that a call fails with a transient error.
    failure_rate: RwLock<f64>,

    /// Artificial latency added to every call.
    latency: RwLock<Duration>,

    /// Calls served, including failed ones.
    calls: AtomicU64,
}

impl MemoryNode {
    /// Create an empty, available node.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self::with_capacity(id, DEFAULT_NODE_CAPACITY)
    }

    /// Create a node with a bounded capacity.
    pub fn with_capacity(id: impl Into<NodeId>, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryExpiry)
            .build();

        Self {
            id: id.into(),
            cache,
            available: AtomicBool::new(true),
            failure_rate: RwLock::new(0.0),
            latency: RwLock::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        }
    }

    /// Take the node down or bring it back with its data intact.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the node is answering calls.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Simulate a process restart: all data is lost and the node comes back up.
    pub fn restart(&self) {
        self.cache.invalidate_all();
        self.set_available(true);
    }

    /// Make a fraction of calls fail with a transient network error.
    pub fn set_failure_rate(&self, rate: f64) {
        *self.failure_rate.write() = rate.clamp(0.0, 1.0);
    }

    /// Add latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of calls received.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Read a value directly, bypassing availability checks.
    pub async fn peek(&self, key: &str) -> Option<Bytes> {
        self.cache
            .get(key)
            .await
            .filter(|e| !e.is_expired())
            .map(|e| e.value)
    }

    /// Number of live entries outside the reserved sync prefix.
    pub fn data_key_count(&self) -> usize {
        self.cache
            .iter()
            .filter(|(k, e)| !k.starts_with(crate::types::SYNC_EVENT_PREFIX) && !e.is_expired())
            .count()
    }

    /// Gate every call on availability, fault injection and latency.
    async fn admit(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.is_available() {
            return Err(Error::Network(NetworkError::ConnectionFailed {
                addr: self.id.clone(),
                reason: "node unavailable".to_string(),
            }));
        }

        let rate = *self.failure_rate.read();
        if rate > 0.0 && rand::rng().random_bool(rate) {
            return Err(Error::Network(NetworkError::ConnectionClosed));
        }

        Ok(())
    }

    async fn live(&self, key: &str) -> Option<Entry> {
        self.cache.get(key).await.filter(|e| !e.is_expired())
    }
}

#[async_trait]
impl NodeClient for MemoryNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.admit().await?;
        Ok(self.live(key).await.map(|e| e.value))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.admit().await?;
        Ok(self.live(key).await.map(|e| StoredEntry {
            ttl_ms: e.remaining_ms(),
            value: e.value.to_vec(),
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.admit().await?;
        self.cache.insert(key.to_string(), Entry::new(value, ttl)).await;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.admit().await?;
        Ok(self
            .cache
            .remove(key)
            .await
            .map_or(false, |e| !e.is_expired()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.admit().await?;
        match self.live(key).await {
            Some(entry) => {
                self.cache
                    .insert(key.to_string(), Entry::new(entry.value, Some(ttl)))
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.admit().await?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.live(key).await.map(|e| e.value));
        }
        Ok(values)
    }

    async fn mset(&self, entries: Vec<WriteEntry>) -> Result<()> {
        self.admit().await?;
        for entry in entries {
            self.cache
                .insert(entry.key, Entry::new(entry.value, entry.ttl))
                .await;
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.admit().await?;
        let mut keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
            .map(|(k, _)| (*k).clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        self.admit().await
    }
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode")
            .field("id", &self.id)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Connector handing out shared [`MemoryNode`]s, creating them on first use.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnector {
    nodes: Arc<DashMap<NodeId, Arc<MemoryNode>>>,
}

impl MemoryConnector {
    /// Create an empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the node with this id.
    pub fn node(&self, id: &str) -> Arc<MemoryNode> {
        self.nodes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new(id)))
            .clone()
    }

    /// All nodes created so far.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl NodeConnector for MemoryConnector {
    fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>> {
        Ok(self.node(&node.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let node = MemoryNode::new("n1");

        node.set("key1", Bytes::from("value1"), None).await.unwrap();

        assert_eq!(node.get("key1").await.unwrap(), Some(Bytes::from("value1")));
        assert_eq!(node.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let node = MemoryNode::new("n1");

        node.set("short", Bytes::from("v"), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        let entry = node.get_with_ttl("short").await.unwrap().unwrap();
        assert!(entry.ttl_ms.unwrap() <= 30);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(node.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_existing_key() {
        let node = MemoryNode::new("n1");
        node.set("k", Bytes::from("v"), None).await.unwrap();

        assert!(node.expire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!node.expire("nope", Duration::from_secs(60)).await.unwrap());

        let entry = node.get_with_ttl("k").await.unwrap().unwrap();
        assert!(entry.ttl_ms.is_some());
    }

    #[tokio::test]
    async fn test_del() {
        let node = MemoryNode::new("n1");
        node.set("k", Bytes::from("v"), None).await.unwrap();

        assert!(node.del("k").await.unwrap());
        assert!(!node.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_and_keys() {
        let node = MemoryNode::new("n1");
        node.mset(vec![
            WriteEntry::new("user:1", "a", None),
            WriteEntry::new("user:2", "b", None),
            WriteEntry::new("order:1", "c", None),
        ])
        .await
        .unwrap();

        let values = node
            .mget(&["user:1".to_string(), "nope".to_string(), "order:1".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(Bytes::from("a")), None, Some(Bytes::from("c"))]);

        node.cache.run_pending_tasks().await;
        assert_eq!(node.keys("user:").await.unwrap(), vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn test_unavailable_and_restart() {
        let node = MemoryNode::new("n1");
        node.set("k", Bytes::from("v"), None).await.unwrap();

        node.set_available(false);
        let err = node.get("k").await.unwrap_err();
        assert!(err.is_transient());
        assert!(node.ping().await.is_err());

        node.set_available(true);
        assert_eq!(node.get("k").await.unwrap(), Some(Bytes::from("v")));

        node.restart();
        assert_eq!(node.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_failure_rate() {
        let node = MemoryNode::new("n1");
        node.set_failure_rate(1.0);
        assert!(node.ping().await.is_err());
        node.set_failure_rate(0.0);
        assert!(node.ping().await.is_ok());
    }

    #[test]
    fn test_connector_reuses_nodes() {
        let connector = MemoryConnector::new();
        let config = NodeConfig::new("h", 1);
        let a = connector.connect(&config).unwrap();
        let b = connector.connect(&config).unwrap();
        assert_eq!(a.node_id(), b.node_id());
        assert_eq!(connector.node_ids(), vec!["h:1".to_string()]);
    }
}
