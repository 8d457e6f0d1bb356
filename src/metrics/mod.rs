//! Operational counters for the replicated cache.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      CacheMetrics                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Requests    │  │ Replication  │  │ Anti-entropy   │  │
//! │  │ - gets/hits  │  │ - threshold  │  │ - passes       │  │
//! │  │ - sets/dels  │  │ - secondary  │  │ - conflicts    │  │
//! │  │ - expires    │  │ - keys moved │  │ - repairs      │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use ringcache::metrics::CacheMetrics;
//!
//! let metrics = CacheMetrics::new();
//! metrics.record_get(true);
//! metrics.record_get(false);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.get_total, 2);
//! assert_eq!(snapshot.hit_rate(), 0.5);
//! ```

mod counters;

pub use counters::{Counter, LabeledCounter};

/// Counters shared by every component of one cache instance.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Total reads.
    pub get_total: Counter,
    /// Reads that found a value.
    pub get_hits: Counter,
    /// Reads that found nothing.
    pub get_misses: Counter,
    /// Total writes.
    pub set_total: Counter,
    /// Total deletes.
    pub delete_total: Counter,
    /// Total expire calls.
    pub expire_total: Counter,

    /// Operations that missed their consistency threshold.
    pub threshold_failures: Counter,
    /// Fire-and-forget replica writes that failed, per node.
    pub secondary_failures: LabeledCounter<1>,

    /// Sync events recorded by this process.
    pub events_recorded: Counter,
    /// Completed anti-entropy passes.
    pub sync_passes: Counter,
    /// Keys with more than one competing event.
    pub sync_conflicts: Counter,
    /// Replicas rewritten by anti-entropy.
    pub sync_repairs: Counter,
    /// Broadcast events removed by cleanup.
    pub events_cleaned: Counter,

    /// Keys moved by membership changes.
    pub keys_moved: Counter,
}

impl CacheMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            get_total: Counter::new("cache_get_total", "Total GET requests"),
            get_hits: Counter::new("cache_get_hits", "GET requests that found a value"),
            get_misses: Counter::new("cache_get_misses", "GET requests that found nothing"),
            set_total: Counter::new("cache_set_total", "Total SET requests"),
            delete_total: Counter::new("cache_delete_total", "Total DELETE requests"),
            expire_total: Counter::new("cache_expire_total", "Total EXPIRE requests"),
            threshold_failures: Counter::new(
                "replication_threshold_failures_total",
                "Operations below their consistency threshold",
            ),
            secondary_failures: LabeledCounter::new(
                "replication_secondary_failures_total",
                "Failed fire-and-forget replica writes",
                ["node"],
            ),
            events_recorded: Counter::new("sync_events_recorded_total", "Sync events recorded"),
            sync_passes: Counter::new("sync_passes_total", "Completed anti-entropy passes"),
            sync_conflicts: Counter::new("sync_conflicts_total", "Keys with competing events"),
            sync_repairs: Counter::new("sync_repairs_total", "Replicas rewritten by anti-entropy"),
            events_cleaned: Counter::new("sync_events_cleaned_total", "Expired sync events deleted"),
            keys_moved: Counter::new("rebalance_keys_moved_total", "Keys moved by membership changes"),
        }
    }

    /// Record a read.
    pub fn record_get(&self, hit: bool) {
        self.get_total.inc();
        if hit {
            self.get_hits.inc();
        } else {
            self.get_misses.inc();
        }
    }

    /// Record a failed secondary write to `node_id`.
    pub fn record_secondary_failure(&self, node_id: &str) {
        self.secondary_failures.inc([node_id]);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            get_total: self.get_total.get(),
            get_hits: self.get_hits.get(),
            get_misses: self.get_misses.get(),
            set_total: self.set_total.get(),
            delete_total: self.delete_total.get(),
            expire_total: self.expire_total.get(),
            threshold_failures: self.threshold_failures.get(),
            secondary_failures: self.secondary_failures.total(),
            events_recorded: self.events_recorded.get(),
            sync_passes: self.sync_passes.get(),
            sync_conflicts: self.sync_conflicts.get(),
            sync_repairs: self.sync_repairs.get(),
            events_cleaned: self.events_cleaned.get(),
            keys_moved: self.keys_moved.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.get_total,
            &self.get_hits,
            &self.get_misses,
            &self.set_total,
            &self.delete_total,
            &self.expire_total,
            &self.threshold_failures,
            &self.events_recorded,
            &self.sync_passes,
            &self.sync_conflicts,
            &self.sync_repairs,
            &self.events_cleaned,
            &self.keys_moved,
        ] {
            output.push_str(&format!(
                "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                counter.name(),
                counter.help(),
                counter.name(),
                counter.name(),
                counter.get()
            ));
        }

        output.push_str(&self.secondary_failures.render());
        output
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub get_total: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub set_total: u64,
    pub delete_total: u64,
    pub expire_total: u64,
    pub threshold_failures: u64,
    pub secondary_failures: u64,
    pub events_recorded: u64,
    pub sync_passes: u64,
    pub sync_conflicts: u64,
    pub sync_repairs: u64,
    pub events_cleaned: u64,
    pub keys_moved: u64,
}

impl MetricsSnapshot {
    /// Fraction of reads that found a value.
    pub fn hit_rate(&self) -> f64 {
        if self.get_total == 0 {
            0.0
        } else {
            self.get_hits as f64 / self.get_total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_metrics() {
        let metrics = CacheMetrics::new();

        metrics.record_get(true);
        metrics.record_get(true);
        metrics.record_get(false);
        metrics.set_total.inc();
        metrics.record_secondary_failure("a:1");
        metrics.record_secondary_failure("b:1");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get_total, 3);
        assert_eq!(snapshot.get_misses, 1);
        assert_eq!(snapshot.set_total, 1);
        assert_eq!(snapshot.secondary_failures, 2);
        assert!((snapshot.hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CacheMetrics::new();
        metrics.record_get(true);
        metrics.record_secondary_failure("a:1");

        let output = metrics.to_prometheus();

        assert!(output.contains("cache_get_total 1"));
        assert!(output.contains("sync_passes_total 0"));
        assert!(output.contains("replication_secondary_failures_total{node=\"a:1\"} 1"));
        assert!(output.contains("# TYPE"));
    }
}
