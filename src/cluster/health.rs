//! Per-node health tracking.
//!
//! A node that fails a ping is marked unhealthy but stays a ring member;
//! eviction is an explicit `remove_node` call.

use crate::types::{now_millis, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Last observed health of a backing node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealth {
    /// Whether the last ping succeeded.
    pub healthy: bool,
    /// Consecutive failed pings.
    pub consecutive_failures: u32,
    /// Error from the last failed ping.
    pub last_error: Option<String>,
    /// Wall-clock time (ms) of the last check.
    pub last_checked: Option<u64>,
}

impl Default for NodeHealth {
    /// Nodes start healthy until a ping says otherwise.
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_error: None,
            last_checked: None,
        }
    }
}

/// Change in a node's health caused by one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Still healthy.
    StillHealthy,
    /// Healthy before, failed now.
    BecameUnhealthy,
    /// Failed again.
    StillUnhealthy,
    /// Unhealthy before, healthy now.
    Recovered,
}

/// Health table for all known nodes.
#[derive(Debug, Default)]
pub struct HealthTable {
    nodes: HashMap<NodeId, NodeHealth>,
}

impl HealthTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a node.
    pub fn insert(&mut self, node_id: NodeId) {
        self.nodes.entry(node_id).or_default();
    }

    /// Stop tracking a node.
    pub fn remove(&mut self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Record a successful ping.
    pub fn record_success(&mut self, node_id: &str) -> HealthTransition {
        let health = self.nodes.entry(node_id.to_string()).or_default();
        let was_healthy = health.healthy;

        health.healthy = true;
        health.consecutive_failures = 0;
        health.last_error = None;
        health.last_checked = Some(now_millis());

        if was_healthy {
            HealthTransition::StillHealthy
        } else {
            HealthTransition::Recovered
        }
    }

    /// Record a failed ping.
    pub fn record_failure(&mut self, node_id: &str, error: String) -> HealthTransition {
        let health = self.nodes.entry(node_id.to_string()).or_default();
        let was_healthy = health.healthy;

        health.healthy = false;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_error = Some(error);
        health.last_checked = Some(now_millis());

        if was_healthy {
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::StillUnhealthy
        }
    }

    /// Whether a node is healthy. Unknown nodes are not.
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).is_some_and(|h| h.healthy)
    }

    /// Detailed health of one node.
    pub fn get(&self, node_id: &str) -> Option<NodeHealth> {
        self.nodes.get(node_id).cloned()
    }

    /// `NodeId -> healthy` for every tracked node, ordered by id.
    pub fn snapshot(&self) -> BTreeMap<NodeId, bool> {
        self.nodes
            .iter()
            .map(|(id, h)| (id.clone(), h.healthy))
            .collect()
    }

    /// Number of healthy nodes.
    pub fn healthy_count(&self) -> usize {
        self.nodes.values().filter(|h| h.healthy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut table = HealthTable::new();
        table.insert("a".into());
        assert!(table.is_healthy("a"));

        assert_eq!(table.record_success("a"), HealthTransition::StillHealthy);
        assert_eq!(
            table.record_failure("a", "refused".into()),
            HealthTransition::BecameUnhealthy
        );
        assert_eq!(
            table.record_failure("a", "refused".into()),
            HealthTransition::StillUnhealthy
        );
        assert_eq!(table.get("a").unwrap().consecutive_failures, 2);
        assert_eq!(table.record_success("a"), HealthTransition::Recovered);
        assert_eq!(table.get("a").unwrap().last_error, None);
    }

    #[test]
    fn test_snapshot_and_counts() {
        let mut table = HealthTable::new();
        table.insert("a".into());
        table.insert("b".into());
        table.record_failure("b", "timeout".into());

        let snapshot = table.snapshot();
        assert_eq!(snapshot.get("a"), Some(&true));
        assert_eq!(snapshot.get("b"), Some(&false));
        assert_eq!(table.healthy_count(), 1);

        table.remove("b");
        assert!(!table.is_healthy("b"));
        assert_eq!(table.snapshot().len(), 1);
    }
}
