//! Key redistribution after a membership change.
//!
//! Every key held by a member of the old ring is checked against both
//! rings. When its replica set changed, the entry (value and remaining TTL)
//! is copied to each new owner that lacks it, and only once every copy
//! succeeded is it deleted from holders that are no longer replicas.

use crate::cluster::ClusterManager;
use crate::partitioning::HashRing;
use crate::types::{NodeId, StoredEntry, SYNC_EVENT_PREFIX};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Outcome of a redistribution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Distinct data keys found on the scanned nodes.
    pub keys_scanned: usize,
    /// Keys whose placement was changed.
    pub keys_moved: usize,
    /// Entries written to new owners.
    pub copies: usize,
    /// Entries deleted from former owners.
    pub removals: usize,
    /// Reads, copies or deletes that failed.
    pub failures: usize,
}

impl RebalanceReport {
    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// A key whose replica set differs between the two rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMove {
    /// The key.
    pub key: String,
    /// Nodes currently holding it.
    pub holders: BTreeSet<NodeId>,
    /// Replicas under the new ring.
    pub new_owners: BTreeSet<NodeId>,
}

impl KeyMove {
    /// New owners that do not hold the key yet.
    pub fn missing(&self) -> impl Iterator<Item = &NodeId> {
        self.new_owners.difference(&self.holders)
    }

    /// Holders that are no longer replicas.
    pub fn stale(&self) -> impl Iterator<Item = &NodeId> {
        self.holders.difference(&self.new_owners)
    }
}

/// Compute the moves needed for keys held by `holders_by_key`.
pub fn plan_moves(
    holders_by_key: BTreeMap<String, BTreeSet<NodeId>>,
    new_ring: &HashRing,
    factor: usize,
) -> Vec<KeyMove> {
    holders_by_key
        .into_iter()
        .filter_map(|(key, holders)| {
            let new_owners: BTreeSet<NodeId> = new_ring.get_node_ids(&key, factor).into_iter().collect();
            if new_owners == holders {
                return None;
            }
            Some(KeyMove {
                key,
                holders,
                new_owners,
            })
        })
        .collect()
}

/// Move keys from `old_ring` placement to `new_ring` placement.
///
/// Every member of the old ring must still be reachable through `cluster`.
pub async fn redistribute(
    cluster: &ClusterManager,
    old_ring: &HashRing,
    new_ring: &HashRing,
    factor: usize,
) -> RebalanceReport {
    let mut report = RebalanceReport::default();
    let mut holders_by_key: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();

    for node in old_ring.nodes() {
        match cluster.keys(&node.id, "").await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| !k.starts_with(SYNC_EVENT_PREFIX)) {
                    holders_by_key.entry(key).or_default().insert(node.id.clone());
                }
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Failed to list keys for redistribution");
                report.failures += 1;
            }
        }
    }

    report.keys_scanned = holders_by_key.len();
    let moves = plan_moves(holders_by_key, new_ring, factor);
    debug!(keys = report.keys_scanned, moves = moves.len(), "Redistribution planned");

    for key_move in moves {
        move_key(cluster, &key_move, &mut report).await;
    }

    info!(
        keys_scanned = report.keys_scanned,
        keys_moved = report.keys_moved,
        copies = report.copies,
        removals = report.removals,
        failures = report.failures,
        "Redistribution complete"
    );
    report
}

async fn read_entry(cluster: &ClusterManager, key_move: &KeyMove, report: &mut RebalanceReport) -> Option<StoredEntry> {
    for holder in &key_move.holders {
        match cluster.get_with_ttl(holder, &key_move.key).await {
            Ok(Some(entry)) => return Some(entry),
            Ok(None) => {}
            Err(e) => {
                warn!(node_id = %holder, key = %key_move.key, error = %e, "Failed to read key for redistribution");
                report.failures += 1;
            }
        }
    }
    None
}

async fn move_key(cluster: &ClusterManager, key_move: &KeyMove, report: &mut RebalanceReport) {
    // Expired since the scan, or unreadable.
    let Some(entry) = read_entry(cluster, key_move, report).await else {
        return;
    };
    if entry.ttl_ms == Some(0) {
        return;
    }

    let value = Bytes::from(entry.value.clone());
    let mut copied_all = true;
    let mut changed = false;

    for target in key_move.missing() {
        match cluster.set(target, &key_move.key, value.clone(), entry.ttl()).await {
            Ok(()) => {
                report.copies += 1;
                changed = true;
            }
            Err(e) => {
                warn!(node_id = %target, key = %key_move.key, error = %e, "Failed to copy key to new owner");
                report.failures += 1;
                copied_all = false;
            }
        }
    }

    if copied_all {
        for stale in key_move.stale() {
            match cluster.del(stale, &key_move.key).await {
                Ok(_) => {
                    report.removals += 1;
                    changed = true;
                }
                Err(e) => {
                    warn!(node_id = %stale, key = %key_move.key, error = %e, "Failed to remove key from former owner");
                    report.failures += 1;
                }
            }
        }
    }

    if changed {
        report.keys_moved += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::partitioning::HashNode;
    use crate::storage::{MemoryNode, NodeClient};
    use std::sync::Arc;
    use std::time::Duration;

    fn ring_of(ids: &[&str]) -> HashRing {
        HashRing::from_nodes(ids.iter().map(|id| HashNode::new(*id, 1.0)), 50)
    }

    #[test]
    fn test_plan_skips_unchanged_keys() {
        let ring = ring_of(&["a", "b", "c"]);
        let mut holders = BTreeMap::new();
        let owners: BTreeSet<NodeId> = ring.get_node_ids("k1", 2).into_iter().collect();
        holders.insert("k1".to_string(), owners.clone());

        assert!(plan_moves(holders.clone(), &ring, 2).is_empty());

        let grown = ring_of(&["a", "b", "c", "d"]);
        let moves = plan_moves(holders, &grown, 4);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].missing().count(), 2);
        assert_eq!(moves[0].stale().count(), 0);
    }

    #[tokio::test]
    async fn test_redistribute_on_removal() {
        let cluster = ClusterManager::new(ClusterConfig::default());
        let mut nodes = BTreeMap::new();
        for id in ["a", "b", "c"] {
            let node = Arc::new(MemoryNode::new(id));
            cluster.add_node(id.to_string(), node.clone());
            nodes.insert(id, node);
        }

        let old_ring = ring_of(&["a", "b", "c"]);
        for i in 0..50 {
            let key = format!("key-{}", i);
            for owner in old_ring.get_node_ids(&key, 2) {
                nodes[owner.as_str()]
                    .set(&key, Bytes::from("v"), Some(Duration::from_secs(600)))
                    .await
                    .unwrap();
            }
        }

        let mut new_ring = old_ring.clone();
        new_ring.remove_node("c");
        let report = redistribute(&cluster, &old_ring, &new_ring, 2).await;

        assert!(report.is_clean());
        assert_eq!(report.keys_scanned, 50);
        assert!(report.keys_moved > 0);

        for i in 0..50 {
            let key = format!("key-{}", i);
            for owner in new_ring.get_node_ids(&key, 2) {
                let entry = nodes[owner.as_str()].get_with_ttl(&key).await.unwrap().unwrap();
                assert!(entry.ttl_ms.is_some());
            }
            assert_eq!(nodes["c"].peek(&key).await, None);
        }
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_source() {
        let cluster = ClusterManager::new(
            ClusterConfig::default()
                .with_retry_attempts(1)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
        );
        let a = Arc::new(MemoryNode::new("a"));
        let b = Arc::new(MemoryNode::new("b"));
        cluster.add_node("a".into(), a.clone());
        cluster.add_node("b".into(), b.clone());

        a.set("k", Bytes::from("v"), None).await.unwrap();
        b.set_available(false);

        let key_move = KeyMove {
            key: "k".to_string(),
            holders: ["a".to_string()].into_iter().collect(),
            new_owners: ["b".to_string()].into_iter().collect(),
        };
        let mut report = RebalanceReport::default();
        move_key(&cluster, &key_move, &mut report).await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.removals, 0);
        assert_eq!(a.peek("k").await, Some(Bytes::from("v")));
    }
}
