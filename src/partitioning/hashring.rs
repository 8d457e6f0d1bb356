//! Consistent hashing with weighted virtual nodes.
//!
//! Each physical node is represented by `floor(base_vnodes * weight)` virtual
//! nodes (vnodes) so that key ownership is proportional to node capacity.

use crate::types::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Base number of virtual nodes for a node of weight 1.0.
pub const DEFAULT_BASE_VNODES: usize = 150;

/// A physical backing node and its relative capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct HashNode {
    /// Node identifier.
    pub id: NodeId,
    /// Relative capacity; 1.0 is the baseline.
    pub weight: f64,
}

impl HashNode {
    /// Create a node with the given weight.
    pub fn new(id: impl Into<NodeId>, weight: f64) -> Self {
        Self {
            id: id.into(),
            weight,
        }
    }
}

/// A consistent hash ring for distributing keys across nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual node positions mapped to their owning physical node.
    /// Kept sorted by the map itself.
    vnodes: BTreeMap<u64, NodeId>,

    /// Base vnode count for a node of weight 1.0.
    base_vnodes: usize,

    /// Physical nodes in the ring, by id.
    nodes: HashMap<NodeId, HashNode>,
}

impl HashRing {
    /// Create a new empty hash ring with the default vnode count.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_BASE_VNODES)
    }

    /// Create a new hash ring with a custom base vnode count.
    pub fn with_vnodes(base_vnodes: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            base_vnodes: base_vnodes.max(1),
            nodes: HashMap::new(),
        }
    }

    /// Build a ring from an initial node list.
    pub fn from_nodes(nodes: impl IntoIterator<Item = HashNode>, base_vnodes: usize) -> Self {
        let mut ring = Self::with_vnodes(base_vnodes);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    /// Get the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the total number of virtual nodes.
    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Get all physical nodes, sorted by id.
    pub fn nodes(&self) -> Vec<HashNode> {
        let mut nodes: Vec<HashNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Check if a node is in the ring.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of virtual nodes a node of this weight receives.
    fn vnodes_for(&self, weight: f64) -> usize {
        ((self.base_vnodes as f64 * weight).floor() as usize).max(1)
    }

    /// Add a node to the ring. Adding an existing id is a no-op.
    pub fn add_node(&mut self, node: HashNode) {
        if self.nodes.contains_key(&node.id) {
            return;
        }

        for i in 0..self.vnodes_for(node.weight) {
            let hash = Self::hash_key(format!("{}:{}", node.id, i).as_bytes());
            // On a collision the existing owner keeps the point.
            self.vnodes.entry(hash).or_insert_with(|| node.id.clone());
        }

        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node and all of its virtual nodes.
    pub fn remove_node(&mut self, node_id: &str) -> Option<HashNode> {
        let node = self.nodes.remove(node_id)?;

        for i in 0..self.vnodes_for(node.weight) {
            let hash = Self::hash_key(format!("{}:{}", node.id, i).as_bytes());
            if self.vnodes.get(&hash).map(String::as_str) == Some(node_id) {
                self.vnodes.remove(&hash);
            }
        }

        Some(node)
    }

    /// Get the node owning a key.
    ///
    /// Returns None if the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<HashNode> {
        let hash = Self::hash_key(key.as_bytes());
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .and_then(|(_, id)| self.nodes.get(id).cloned())
    }

    /// Get up to `count` distinct physical nodes for a key, primary first.
    ///
    /// Walks the ring clockwise from the key's position, skipping virtual
    /// nodes of physical nodes already collected.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<HashNode> {
        let wanted = count.min(self.nodes.len());
        let mut owners: Vec<HashNode> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let hash = Self::hash_key(key.as_bytes());
        let iter = self.vnodes.range(hash..).chain(self.vnodes.range(..hash));

        for (_, node_id) in iter {
            if owners.iter().any(|n| &n.id == node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(node_id) {
                owners.push(node.clone());
                if owners.len() >= wanted {
                    break;
                }
            }
        }

        owners
    }

    /// Get the ids of up to `count` replica owners for a key.
    pub fn get_node_ids(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.get_nodes(key, count).into_iter().map(|n| n.id).collect()
    }

    /// Calculate the hash of a key using xxHash64.
    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.finish()
    }

    /// Primary-ownership counts for a sample of synthetic keys.
    ///
    /// Useful for checking that ownership follows node weights.
    pub fn get_distribution(&self, sample_size: usize) -> HashMap<NodeId, usize> {
        let mut distribution = HashMap::new();

        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.get_node(&key) {
                *distribution.entry(owner.id).or_insert(0) += 1;
            }
        }

        distribution
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
