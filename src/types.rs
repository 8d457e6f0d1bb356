//! Core types used throughout the replicated cache.

use crate::replication::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster, `"host:port"` unless configured otherwise.
pub type NodeId = String;

/// Key prefix reserved for broadcast sync events on backing nodes.
pub const SYNC_EVENT_PREFIX: &str = "__sync:event:";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert an optional TTL to whole milliseconds for the wire.
pub fn ttl_to_millis(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|d| d.as_millis() as u64)
}

/// A stored entry read back with its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The serialized value.
    pub value: Vec<u8>,
    /// Remaining time to live in milliseconds, if the entry expires.
    pub ttl_ms: Option<u64>,
}

impl StoredEntry {
    /// Remaining TTL as a duration.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Anti-entropy status of this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether a synchronization pass is running right now.
    pub in_progress: bool,
    /// Wall-clock time (ms) of the last completed pass.
    pub last_sync: Option<u64>,
    /// Number of events in the local per-key log.
    pub event_count: usize,
}

/// Aggregated health returned by the facade.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Last observed health per backing node.
    pub cluster: BTreeMap<NodeId, bool>,
    /// Anti-entropy status.
    pub sync: SyncStatus,
    /// This process's node id.
    pub node_id: NodeId,
}

impl HealthStatus {
    /// Whether every known node answered its last ping.
    pub fn all_healthy(&self) -> bool {
        self.cluster.values().all(|&healthy| healthy)
    }
}

/// Cluster statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Number of ring members.
    pub total_nodes: usize,
    /// Members whose last ping succeeded.
    pub healthy_nodes: usize,
    /// Configured replication factor.
    pub replication_factor: usize,
    /// Configured consistency level.
    pub consistency: ConsistencyLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_entry_ttl() {
        let entry = StoredEntry {
            value: b"1".to_vec(),
            ttl_ms: Some(1500),
        };
        assert_eq!(entry.ttl(), Some(Duration::from_millis(1500)));
        assert_eq!(ttl_to_millis(Some(Duration::from_secs(2))), Some(2000));
        assert_eq!(ttl_to_millis(None), None);
    }

    #[test]
    fn test_health_status_all_healthy() {
        let mut cluster = BTreeMap::new();
        cluster.insert("a:1".to_string(), true);
        cluster.insert("b:1".to_string(), false);
        let status = HealthStatus {
            cluster,
            sync: SyncStatus::default(),
            node_id: "app".to_string(),
        };
        assert!(!status.all_healthy());
    }
}
