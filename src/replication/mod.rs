//! Replication across the hash ring.
//!
//! [`ReplicationManager`] writes each key to `factor` distinct nodes and
//! reads it back under one of three [`ConsistencyLevel`]s. Membership
//! changes redistribute keys before the ring is released.

pub mod consistency;
pub mod manager;
pub mod rebalance;

pub use consistency::{quorum_size, ConsistencyLevel};
pub use manager::{ReplicationManager, WriteOp};
pub use rebalance::{RebalanceReport, KeyMove};
