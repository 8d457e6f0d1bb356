//! Wall clocks and logical clocks used to order sync events.

use crate::types::{now_millis, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug + 'static {
    /// Current time.
    fn now_ms(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_millis()
    }
}

/// The system clock shifted by a fixed offset, to simulate skew.
#[derive(Debug, Default)]
pub struct SkewedClock {
    offset_ms: AtomicI64,
}

impl SkewedClock {
    /// A clock running `offset_ms` ahead (positive) or behind (negative).
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Change the offset.
    pub fn set_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }
}

impl Clock for SkewedClock {
    fn now_ms(&self) -> u64 {
        let offset = self.offset_ms.load(Ordering::Relaxed);
        now_millis().saturating_add_signed(offset)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Start at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Jump to `now_ms`.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Lamport clock: ticks on every local event, jumps past every observed value.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event and return the new value.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a value observed from another node.
    pub fn observe(&self, remote: u64) {
        self.counter.fetch_max(remote, Ordering::SeqCst);
    }

    /// Current value.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Causal relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Same history.
    Equal,
    /// Strictly happened before the other.
    Before,
    /// Strictly happened after the other.
    After,
    /// Neither saw the other.
    Concurrent,
}

/// Per-origin event counters compared by dominance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: BTreeMap<NodeId, u64>,
}

impl VersionVector {
    /// Empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for an origin.
    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    /// Increment the counter for `node_id`.
    pub fn increment(&mut self, node_id: &str) -> u64 {
        let counter = self.counters.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VersionVector) {
        for (node, &count) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Compare with `other`.
    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut ordering = CmpOrdering::Equal;

        for node in self.counters.keys().chain(other.counters.keys()) {
            let step = self.get(node).cmp(&other.get(node));
            ordering = match (ordering, step) {
                (o, CmpOrdering::Equal) => o,
                (CmpOrdering::Equal, s) => s,
                (o, s) if o == s => o,
                _ => return Causality::Concurrent,
            };
        }

        match ordering {
            CmpOrdering::Equal => Causality::Equal,
            CmpOrdering::Less => Causality::Before,
            CmpOrdering::Greater => Causality::After,
        }
    }

    /// Whether this vector has seen everything `other` has and more.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == Causality::After
    }
}
