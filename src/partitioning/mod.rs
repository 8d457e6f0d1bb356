//! Partitioning module for placing keys on backing nodes.
//!
//! This module implements weighted consistent hashing, ensuring:
//! - Key ownership proportional to node weight
//! - Minimal key movement when nodes join/leave
//! - Distinct physical replicas for each key
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         HashRing                            │
//! │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐            │
//! │  │VN:a │→│VN:b │→│VN:a │→│VN:c │→│VN:b │→│VN:c │ → wraps    │
//! │  └─────┘ └─────┘ └─────┘ └─────┘ └─────┘ └─────┘            │
//! │    floor(150 * weight) virtual nodes per physical node      │
//! │                                                             │
//! │  Key "user:123" → hash → first VN ≥ hash → a (primary)      │
//! │                                         → c, b (replicas)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use ringcache::partitioning::{HashNode, HashRing};
//!
//! let mut ring = HashRing::new();
//! ring.add_node(HashNode::new("10.0.0.1:6379", 1.0));
//! ring.add_node(HashNode::new("10.0.0.2:6379", 1.0));
//! ring.add_node(HashNode::new("10.0.0.3:6379", 2.0));
//!
//! let replicas = ring.get_nodes("user:123", 2);
//! assert_eq!(replicas.len(), 2);
//! assert_ne!(replicas[0].id, replicas[1].id);
//! ```

mod hashring;

pub use hashring::{HashNode, HashRing, DEFAULT_BASE_VNODES};
