//! Configuration types for the replicated cache.

use crate::error::{Error, Result};
use crate::partitioning::{HashNode, DEFAULT_BASE_VNODES};
use crate::replication::ConsistencyLevel;
use crate::sync::ConflictStrategy;
use crate::types::NodeId;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the replicated cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Identifier of this process, stamped on every sync event it records.
    pub node_id: NodeId,

    /// Backing nodes forming the initial ring.
    pub nodes: Vec<NodeConfig>,

    /// Replication settings.
    pub replication: ReplicationConfig,

    /// Backing-node connection and health settings.
    pub cluster: ClusterConfig,

    /// Anti-entropy settings.
    pub sync: SyncConfig,

    /// Virtual nodes per unit of weight.
    pub base_vnodes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_id: "cache-1".to_string(),
            nodes: Vec::new(),
            replication: ReplicationConfig::default(),
            cluster: ClusterConfig::default(),
            sync: SyncConfig::default(),
            base_vnodes: DEFAULT_BASE_VNODES,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration for the given process id and nodes.
    pub fn new(node_id: impl Into<NodeId>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            node_id: node_id.into(),
            nodes,
            ..Default::default()
        }
    }

    /// Read the configuration from `CACHE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from a variable lookup function.
    ///
    /// Unset variables keep their defaults. `CACHE_NODES` is a comma-separated
    /// list of `host:port[:weight]`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("CACHE_NODE_ID") {
            config.node_id = id;
        }

        if let Some(nodes) = lookup("CACHE_NODES") {
            config.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(NodeConfig::from_str)
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(factor) = lookup("CACHE_REPLICATION_FACTOR") {
            config.replication.factor = parse_var("CACHE_REPLICATION_FACTOR", &factor)?;
        }

        if let Some(level) = lookup("CACHE_CONSISTENCY") {
            config.replication.consistency = level.parse()?;
        }

        if let Some(ms) = lookup("CACHE_SYNC_INTERVAL_MS") {
            config.replication.sync_interval =
                Duration::from_millis(parse_var("CACHE_SYNC_INTERVAL_MS", &ms)?);
        }

        if let Some(ms) = lookup("CACHE_HEALTH_CHECK_INTERVAL_MS") {
            config.cluster.health_check_interval =
                Duration::from_millis(parse_var("CACHE_HEALTH_CHECK_INTERVAL_MS", &ms)?);
        }

        if let Some(attempts) = lookup("CACHE_RETRY_ATTEMPTS") {
            config.cluster.retry_attempts = parse_var("CACHE_RETRY_ATTEMPTS", &attempts)?;
        }

        if let Some(ms) = lookup("CACHE_OP_TIMEOUT_MS") {
            config.cluster.op_timeout =
                Duration::from_millis(parse_var("CACHE_OP_TIMEOUT_MS", &ms)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the process id.
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Add a backing node.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set the replication configuration.
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication.factor = factor;
        self
    }

    /// Set the consistency level.
    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.replication.consistency = consistency;
        self
    }

    /// Set the anti-entropy interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.replication.sync_interval = interval;
        self
    }

    /// Set the cluster configuration.
    pub fn with_cluster_config(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Set the sync configuration.
    pub fn with_sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Set the conflict resolution strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.sync.strategy = strategy;
        self
    }

    /// Set the base virtual node count.
    pub fn with_base_vnodes(mut self, base_vnodes: usize) -> Self {
        self.base_vnodes = base_vnodes;
        self
    }

    /// Ring members described by this configuration.
    pub fn hash_nodes(&self) -> Vec<HashNode> {
        self.nodes
            .iter()
            .map(|n| HashNode::new(n.id(), n.weight))
            .collect()
    }

    /// Check the configuration; invalid settings are fatal at construction.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }

        if self.nodes.is_empty() {
            return Err(Error::Config("at least one node is required".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.id()) {
                return Err(Error::Config(format!("duplicate node id {}", node.id())));
            }
        }

        self.replication.validate(self.nodes.len())?;
        self.cluster.validate()?;
        self.sync.validate()?;

        if self.base_vnodes == 0 {
            return Err(Error::Config("base_vnodes must be positive".into()));
        }

        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", name, value)))
}

/// A backing node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Explicit id; defaults to `"host:port"`.
    pub id: Option<NodeId>,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Relative capacity.
    pub weight: f64,
}

impl NodeConfig {
    /// Create a node of weight 1.0.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            host: host.into(),
            port,
            weight: 1.0,
        }
    }

    /// Set the node weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set an explicit node id.
    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The node id.
    pub fn id(&self) -> NodeId {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    /// The `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("node host must not be empty".into()));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(Error::Config(format!(
                "node {} has invalid weight {}",
                self.id(),
                self.weight
            )));
        }
        Ok(())
    }
}

impl FromStr for NodeConfig {
    type Err = Error;

    /// Parse `host:port` or `host:port:weight`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (host, port, weight) = match parts.as_slice() {
            [host, port] => (*host, *port, None),
            [host, port, weight] => (*host, *port, Some(*weight)),
            _ => return Err(Error::Config(format!("invalid node address {:?}", s))),
        };

        let port: u16 = parse_var("node port", port)?;
        let mut node = NodeConfig::new(host, port);
        if let Some(weight) = weight {
            node.weight = parse_var("node weight", weight)?;
        }
        node.validate()?;
        Ok(node)
    }
}

/// Replication settings, immutable after construction.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Number of distinct nodes holding each key.
    pub factor: usize,
    /// Read/write consistency level.
    pub consistency: ConsistencyLevel,
    /// Interval between background anti-entropy passes.
    pub sync_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 2,
            consistency: ConsistencyLevel::Eventual,
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl ReplicationConfig {
    /// Create a replication config.
    pub fn new(factor: usize, consistency: ConsistencyLevel) -> Self {
        Self {
            factor,
            consistency,
            ..Default::default()
        }
    }

    fn validate(&self, node_count: usize) -> Result<()> {
        if self.factor == 0 {
            return Err(Error::Config("replication factor must be at least 1".into()));
        }
        if self.factor > node_count {
            return Err(Error::Config(format!(
                "replication factor {} exceeds node count {}",
                self.factor, node_count
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::Config("sync interval must be positive".into()));
        }
        Ok(())
    }
}

/// Backing-node connection, retry and health-check settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Interval between health-check pings.
    pub health_check_interval: Duration,
    /// Total attempts for a transient failure (first try included).
    pub retry_attempts: usize,
    /// Deadline for a single backing-node call.
    pub op_timeout: Duration,
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            retry_attempts: 3,
            op_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl ClusterConfig {
    /// Set the health-check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the retry attempts.
    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the per-call timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.health_check_interval.is_zero() {
            return Err(Error::Config("health check interval must be positive".into()));
        }
        if self.retry_attempts == 0 {
            return Err(Error::Config("retry attempts must be at least 1".into()));
        }
        if self.op_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config("initial backoff exceeds max backoff".into()));
        }
        Ok(())
    }
}

/// Anti-entropy settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How competing events for one key are resolved.
    pub strategy: ConflictStrategy,
    /// Visibility TTL of broadcast events on backing nodes. Locally
    /// recorded events are forgotten after the same period.
    pub event_ttl: Duration,
    /// Age after which the cleanup pass deletes events.
    pub retention: Duration,
    /// Interval between cleanup passes.
    pub cleanup_interval: Duration,
    /// Whether recorded events wake the background loop immediately.
    pub sync_on_event: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::LastWriteWins,
            event_ttl: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            sync_on_event: true,
        }
    }
}

impl SyncConfig {
    /// Set the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set how long events stay visible.
    pub fn with_event_ttl(mut self, ttl: Duration) -> Self {
        self.event_ttl = ttl;
        self
    }

    /// Enable or disable event-triggered passes.
    pub fn with_sync_on_event(mut self, enabled: bool) -> Self {
        self.sync_on_event = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.event_ttl.is_zero() || self.retention.is_zero() || self.cleanup_interval.is_zero() {
            return Err(Error::Config("sync durations must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn three_nodes() -> Vec<NodeConfig> {
        vec![
            NodeConfig::new("10.0.0.1", 6379),
            NodeConfig::new("10.0.0.2", 6379),
            NodeConfig::new("10.0.0.3", 6379).with_weight(2.0),
        ]
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.replication.factor, 2);
        assert_eq!(config.replication.consistency, ConsistencyLevel::Eventual);
        assert_eq!(config.base_vnodes, 150);
        assert_eq!(config.sync.retention, Duration::from_secs(86_400));
        // No nodes configured
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new("app-1", three_nodes())
            .with_replication_factor(3)
            .with_consistency(ConsistencyLevel::Quorum)
            .with_sync_interval(Duration::from_secs(5));

        assert!(config.validate().is_ok());
        assert_eq!(config.node_id, "app-1");
        assert_eq!(config.hash_nodes()[2].weight, 2.0);
        assert_eq!(config.hash_nodes()[0].id, "10.0.0.1:6379");
    }

    #[test]
    fn test_validation_errors() {
        let too_many = CacheConfig::new("a", three_nodes()).with_replication_factor(4);
        assert!(matches!(too_many.validate(), Err(Error::Config(_))));

        let zero = CacheConfig::new("a", three_nodes()).with_replication_factor(0);
        assert!(zero.validate().is_err());

        let dup = CacheConfig::new(
            "a",
            vec![NodeConfig::new("h", 1), NodeConfig::new("h", 1)],
        )
        .with_replication_factor(1);
        assert!(dup.validate().is_err());

        let bad_weight = CacheConfig::new("a", vec![NodeConfig::new("h", 1).with_weight(0.0)])
            .with_replication_factor(1);
        assert!(bad_weight.validate().is_err());

        let no_retries = CacheConfig::new("a", three_nodes())
            .with_cluster_config(ClusterConfig::default().with_retry_attempts(0));
        assert!(no_retries.validate().is_err());
    }

    #[test]
    fn test_node_from_str() {
        let node: NodeConfig = "cache-a:7000".parse().unwrap();
        assert_eq!(node.id(), "cache-a:7000");
        assert_eq!(node.weight, 1.0);

        let node: NodeConfig = "cache-b:7001:2.5".parse().unwrap();
        assert_eq!(node.port, 7001);
        assert_eq!(node.weight, 2.5);

        assert!("nohost".parse::<NodeConfig>().is_err());
        assert!("h:notaport".parse::<NodeConfig>().is_err());
        assert!("h:1:-1".parse::<NodeConfig>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CACHE_NODE_ID", "app-7"),
            ("CACHE_NODES", "a:1, b:2:2, c:3"),
            ("CACHE_REPLICATION_FACTOR", "3"),
            ("CACHE_CONSISTENCY", "strong"),
            ("CACHE_SYNC_INTERVAL_MS", "1500"),
            ("CACHE_RETRY_ATTEMPTS", "5"),
        ]
        .into_iter()
        .collect();

        let config = CacheConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.node_id, "app-7");
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[1].weight, 2.0);
        assert_eq!(config.replication.factor, 3);
        assert_eq!(config.replication.consistency, ConsistencyLevel::Strong);
        assert_eq!(config.replication.sync_interval, Duration::from_millis(1500));
        assert_eq!(config.cluster.retry_attempts, 5);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = CacheConfig::from_lookup(|k| match k {
            "CACHE_NODES" => Some("a:1".to_string()),
            "CACHE_CONSISTENCY" => Some("sometimes".to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
