//! Backing-node health events.

use crate::types::NodeId;

/// Events published by the [`ClusterManager`](super::ClusterManager).
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// A health-check ping failed.
    NodeError {
        /// The node's ID.
        node_id: NodeId,
        /// The failure, rendered.
        error: String,
    },

    /// A node answered a ping after being unhealthy.
    NodeRecovered {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A node was added to the cluster.
    NodeAdded {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A node was removed from the cluster.
    NodeRemoved {
        /// The node's ID.
        node_id: NodeId,
    },
}

impl ClusterEvent {
    /// Get the node ID associated with this event.
    pub fn node_id(&self) -> &str {
        match self {
            ClusterEvent::NodeError { node_id, .. }
            | ClusterEvent::NodeRecovered { node_id }
            | ClusterEvent::NodeAdded { node_id }
            | ClusterEvent::NodeRemoved { node_id } => node_id,
        }
    }

    /// Whether the event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, ClusterEvent::NodeError { .. })
    }
}

/// Listener for cluster events.
pub trait ClusterEventListener: Send + Sync + 'static {
    /// Called when an event occurs.
    fn on_event(&self, event: &ClusterEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl ClusterEventListener for LoggingEventListener {
    fn on_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::NodeError { node_id, error } => {
                tracing::warn!(node_id, error, "Backing node health check failed");
            }
            ClusterEvent::NodeRecovered { node_id } => {
                tracing::info!(node_id, "Backing node recovered");
            }
            ClusterEvent::NodeAdded { node_id } => {
                tracing::info!(node_id, "Backing node added");
            }
            ClusterEvent::NodeRemoved { node_id } => {
                tracing::info!(node_id, "Backing node removed");
            }
        }
    }
}
