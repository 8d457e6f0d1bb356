//! Monotonic counters.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter partitioned by label values, e.g. failures per node.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the series for `labels` by one.
    pub fn inc(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(str::to_string);

        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Value of the series for `labels`.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(str::to_string);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Sum over all series.
    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Render in Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut series: Vec<([String; N], u64)> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        series.sort();

        let mut out = format!("# HELP {} {}\n# TYPE {} counter\n", self.name, self.help, self.name);
        for (labels, value) in series {
            let rendered: Vec<String> = self
                .label_names
                .iter()
                .zip(labels.iter())
                .map(|(name, value)| format!("{}=\"{}\"", name, value))
                .collect();
            out.push_str(&format!("{}{{{}}} {}\n", self.name, rendered.join(","), value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("cache_sets_total", "Writes");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::<1>::new("node_failures_total", "Failures", ["node"]);

        counter.inc(["a:1"]);
        counter.inc(["a:1"]);
        counter.inc(["b:1"]);

        assert_eq!(counter.get(["a:1"]), 2);
        assert_eq!(counter.get(["c:1"]), 0);
        assert_eq!(counter.total(), 3);

        let rendered = counter.render();
        assert!(rendered.contains("node_failures_total{node=\"a:1\"} 2"));
    }
}
