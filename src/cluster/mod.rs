//! Backing-node cluster management.
//!
//! [`ClusterManager`] owns a client per backing node, applies timeouts and
//! retries to every call, and tracks node health.

pub mod events;
pub mod health;
pub mod manager;
pub mod retry;

pub use events::{ClusterEvent, ClusterEventListener, LoggingEventListener};
pub use health::{HealthTable, HealthTransition, NodeHealth};
pub use manager::ClusterManager;
pub use retry::RetryPolicy;
