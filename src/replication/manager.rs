//! Replica placement and consistency-level enforcement.

use crate::cluster::ClusterManager;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::partitioning::{HashNode, HashRing};
use crate::replication::consistency::{quorum_size, ConsistencyLevel};
use crate::replication::rebalance::{redistribute, RebalanceReport};
use crate::storage::{SharedClient, WriteEntry};
use crate::sync::ReplicaPlacement;
use crate::types::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// A mutation applied to each replica of a key.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Store a value.
    Set { value: Bytes, ttl: Option<Duration> },
    /// Delete the key.
    Del,
    /// Set a TTL on the key.
    Expire { ttl: Duration },
}

impl WriteOp {
    /// Operation name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Del => "del",
            WriteOp::Expire { .. } => "expire",
        }
    }

    async fn apply(&self, cluster: &ClusterManager, node_id: &str, key: &str) -> Result<()> {
        match self {
            WriteOp::Set { value, ttl } => cluster.set(node_id, key, value.clone(), *ttl).await,
            WriteOp::Del => cluster.del(node_id, key).await.map(|_| ()),
            WriteOp::Expire { ttl } => cluster.expire(node_id, key, *ttl).await.map(|_| ()),
        }
    }
}

/// Places keys on the ring and enforces the configured consistency level.
///
/// The ring sits behind an async `RwLock`. Reads and the synchronous part
/// of writes hold it shared; membership changes hold it exclusively for
/// the whole redistribution.
pub struct ReplicationManager {
    /// Consistent hash ring.
    ring: RwLock<HashRing>,

    /// Backing-node connections.
    cluster: Arc<ClusterManager>,

    /// Replication settings.
    config: ReplicationConfig,

    /// Fire-and-forget secondary writes.
    pending: TaskTracker,

    /// Shared counters.
    metrics: Arc<CacheMetrics>,
}

impl ReplicationManager {
    /// Create a manager over an existing ring.
    pub fn new(
        ring: HashRing,
        cluster: Arc<ClusterManager>,
        config: ReplicationConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            ring: RwLock::new(ring),
            cluster,
            config,
            pending: TaskTracker::new(),
            metrics,
        }
    }

    /// Replication settings.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Configured consistency level.
    pub fn consistency(&self) -> ConsistencyLevel {
        self.config.consistency
    }

    /// Backing-node connections.
    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    /// Replica set of a key, primary first.
    pub async fn replicas(&self, key: &str) -> Result<Vec<NodeId>> {
        let ring = self.ring.read().await;
        Self::replicas_in(&ring, key, self.config.factor)
    }

    fn replicas_in(ring: &HashRing, key: &str, factor: usize) -> Result<Vec<NodeId>> {
        let replicas = ring.get_node_ids(key, factor);
        if replicas.is_empty() {
            return Err(Error::NoNodes);
        }
        Ok(replicas)
    }

    /// Ring members, sorted by id.
    pub async fn nodes(&self) -> Vec<HashNode> {
        self.ring.read().await.nodes()
    }

    /// Number of ring members.
    pub async fn node_count(&self) -> usize {
        self.ring.read().await.node_count()
    }

    /// Store a value on the key's replicas. Returns the acknowledgements.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<usize> {
        self.write(key, WriteOp::Set { value, ttl }).await
    }

    /// Delete a key from its replicas.
    pub async fn del(&self, key: &str) -> Result<usize> {
        self.write(key, WriteOp::Del).await
    }

    /// Set a TTL on a key's replicas.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<usize> {
        self.write(key, WriteOp::Expire { ttl }).await
    }

    /// Apply `op` to the key's replicas under the consistency level.
    ///
    /// On a threshold failure the returned [`Error::QuorumNotReached`]
    /// carries how many replicas accepted the write; those are not rolled
    /// back.
    pub async fn write(&self, key: &str, op: WriteOp) -> Result<usize> {
        let ring = self.ring.read().await;
        let replicas = Self::replicas_in(&ring, key, self.config.factor)?;

        let result = match self.config.consistency {
            ConsistencyLevel::Eventual => self.write_primary(key, op, replicas).await,
            level => self.write_all(key, op, replicas, level).await,
        };
        drop(ring);

        if matches!(result, Err(Error::QuorumNotReached { .. })) {
            self.metrics.threshold_failures.inc();
        }
        result
    }

    async fn write_all(
        &self,
        key: &str,
        op: WriteOp,
        replicas: Vec<NodeId>,
        level: ConsistencyLevel,
    ) -> Result<usize> {
        let required = level.required_acks(replicas.len());
        let mut writes = JoinSet::new();

        for node_id in replicas {
            let cluster = self.cluster.clone();
            let op = op.clone();
            let key = key.to_string();
            writes.spawn(async move {
                let result = op.apply(&cluster, &node_id, &key).await;
                (node_id, result)
            });
        }

        let mut achieved = 0;
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => achieved += 1,
                Ok((node_id, Err(e))) => {
                    warn!(node_id = %node_id, key, operation = op.name(), error = %e, "Replica write failed");
                }
                Err(e) => {
                    warn!(key, operation = op.name(), error = %e, "Replica write task failed");
                }
            }
        }

        trace!(key, operation = op.name(), achieved, required, "Replicated write");
        if achieved >= required {
            Ok(achieved)
        } else {
            Err(Error::quorum(op.name(), required, achieved))
        }
    }

    async fn write_primary(&self, key: &str, op: WriteOp, replicas: Vec<NodeId>) -> Result<usize> {
        let mut replicas = replicas.into_iter();
        let Some(primary) = replicas.next() else {
            return Err(Error::NoNodes);
        };

        if let Err(e) = op.apply(&self.cluster, &primary, key).await {
            warn!(node_id = %primary, key, operation = op.name(), error = %e, "Primary write failed");
            return Err(Error::quorum(op.name(), 1, 0));
        }

        for node_id in replicas {
            let cluster = self.cluster.clone();
            let metrics = self.metrics.clone();
            let op = op.clone();
            let key = key.to_string();
            self.pending.spawn(async move {
                if let Err(e) = op.apply(&cluster, &node_id, &key).await {
                    warn!(node_id = %node_id, key = %key, operation = op.name(), error = %e, "Secondary write failed");
                    metrics.record_secondary_failure(&node_id);
                }
            });
        }

        Ok(1)
    }

    /// Store several entries, one batch per replica node.
    ///
    /// Each entry gets its own outcome, in input order, judged against the
    /// consistency level over its own replica set. Under eventual
    /// consistency the primaries are written first and the secondary
    /// batches run in the background.
    pub async fn mset(&self, entries: Vec<WriteEntry>) -> Vec<(WriteEntry, Result<usize>)> {
        let ring = self.ring.read().await;
        let placements: Vec<Vec<NodeId>> = entries
            .iter()
            .map(|entry| ring.get_node_ids(&entry.key, self.config.factor))
            .collect();

        let outcomes: Vec<Result<usize>> = match self.config.consistency {
            ConsistencyLevel::Eventual => self.mset_primaries(&entries, &placements).await,
            level => {
                let mut batches: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
                for (index, replicas) in placements.iter().enumerate() {
                    for node_id in replicas {
                        batches.entry(node_id.clone()).or_default().push(index);
                    }
                }
                let acks = self.write_batches(&entries, batches).await;

                placements
                    .iter()
                    .zip(acks)
                    .map(|(replicas, achieved)| {
                        if replicas.is_empty() {
                            return Err(Error::NoNodes);
                        }
                        let required = level.required_acks(replicas.len());
                        if achieved >= required {
                            Ok(achieved)
                        } else {
                            Err(Error::quorum("set", required, achieved))
                        }
                    })
                    .collect()
            }
        };
        drop(ring);

        let failures = outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::QuorumNotReached { .. })))
            .count();
        self.metrics.threshold_failures.inc_by(failures as u64);

        entries.into_iter().zip(outcomes).collect()
    }

    async fn mset_primaries(&self, entries: &[WriteEntry], placements: &[Vec<NodeId>]) -> Vec<Result<usize>> {
        let mut primaries: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for (index, replicas) in placements.iter().enumerate() {
            if let Some(primary) = replicas.first() {
                primaries.entry(primary.clone()).or_default().push(index);
            }
        }
        let acks = self.write_batches(entries, primaries).await;

        let mut secondaries: BTreeMap<NodeId, Vec<WriteEntry>> = BTreeMap::new();
        for (index, replicas) in placements.iter().enumerate() {
            if acks[index] == 0 {
                continue;
            }
            for node_id in replicas.iter().skip(1) {
                secondaries
                    .entry(node_id.clone())
                    .or_default()
                    .push(entries[index].clone());
            }
        }
        for (node_id, batch) in secondaries {
            let cluster = self.cluster.clone();
            let metrics = self.metrics.clone();
            self.pending.spawn(async move {
                let count = batch.len();
                if let Err(e) = cluster.mset(&node_id, batch).await {
                    warn!(node_id = %node_id, entries = count, error = %e, "Secondary batch write failed");
                    metrics.record_secondary_failure(&node_id);
                }
            });
        }

        placements
            .iter()
            .zip(acks)
            .map(|(replicas, achieved)| match (replicas.is_empty(), achieved) {
                (true, _) => Err(Error::NoNodes),
                (false, 0) => Err(Error::quorum("set", 1, 0)),
                (false, _) => Ok(1),
            })
            .collect()
    }

    /// Send each node its batch concurrently. Returns acknowledgements per entry.
    async fn write_batches(&self, entries: &[WriteEntry], batches: BTreeMap<NodeId, Vec<usize>>) -> Vec<usize> {
        let mut writes = JoinSet::new();
        for (node_id, indexes) in batches {
            let cluster = self.cluster.clone();
            let batch: Vec<WriteEntry> = indexes.iter().map(|&i| entries[i].clone()).collect();
            writes.spawn(async move {
                let result = cluster.mset(&node_id, batch).await;
                (node_id, indexes, result)
            });
        }

        let mut acks = vec![0; entries.len()];
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, indexes, Ok(()))) => {
                    for index in indexes {
                        acks[index] += 1;
                    }
                }
                Ok((node_id, indexes, Err(e))) => {
                    warn!(node_id = %node_id, entries = indexes.len(), error = %e, "Replica batch write failed");
                }
                Err(e) => {
                    warn!(error = %e, "Replica batch write task failed");
                }
            }
        }

        trace!(entries = entries.len(), "Replicated batch write");
        acks
    }

    /// Read a key under the consistency level.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let ring = self.ring.read().await;
        let replicas = Self::replicas_in(&ring, key, self.config.factor)?;

        let result = match self.config.consistency {
            ConsistencyLevel::Strong => self.read_first(key, replicas).await,
            ConsistencyLevel::Quorum => self.read_quorum(key, replicas).await,
            ConsistencyLevel::Eventual => self.read_fallthrough(key, replicas).await,
        };
        drop(ring);

        if matches!(result, Err(Error::QuorumNotReached { .. })) {
            self.metrics.threshold_failures.inc();
        }
        result
    }

    fn spawn_reads(&self, key: &str, replicas: Vec<NodeId>) -> JoinSet<(NodeId, Result<Option<Bytes>>)> {
        let mut reads = JoinSet::new();
        for node_id in replicas {
            let cluster = self.cluster.clone();
            let key = key.to_string();
            reads.spawn(async move {
                let result = cluster.get(&node_id, &key).await;
                (node_id, result)
            });
        }
        reads
    }

    /// First non-null answer wins. A miss needs every replica to answer.
    async fn read_first(&self, key: &str, replicas: Vec<NodeId>) -> Result<Option<Bytes>> {
        let total = replicas.len();
        let mut reads = self.spawn_reads(key, replicas);
        let mut answered = 0;

        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((_, Ok(Some(value)))) => return Ok(Some(value)),
                Ok((_, Ok(None))) => answered += 1,
                Ok((node_id, Err(e))) => {
                    debug!(node_id = %node_id, key, error = %e, "Replica read failed");
                }
                Err(_) => {}
            }
        }

        if answered == total {
            Ok(None)
        } else {
            Err(Error::quorum("get", total, answered))
        }
    }

    /// Returns once a quorum agrees the key exists, or that it is absent.
    async fn read_quorum(&self, key: &str, replicas: Vec<NodeId>) -> Result<Option<Bytes>> {
        let quorum = quorum_size(replicas.len());
        let mut reads = self.spawn_reads(key, replicas);
        let mut hits = 0;
        let mut misses = 0;
        let mut value = None;

        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((_, Ok(Some(v)))) => {
                    hits += 1;
                    value.get_or_insert(v);
                    if hits >= quorum {
                        return Ok(value);
                    }
                }
                Ok((_, Ok(None))) => {
                    misses += 1;
                    if misses >= quorum {
                        return Ok(None);
                    }
                }
                Ok((node_id, Err(e))) => {
                    debug!(node_id = %node_id, key, error = %e, "Replica read failed");
                }
                Err(_) => {}
            }
        }

        Err(Error::quorum("get", quorum, hits.max(misses)))
    }

    /// Primary first, then the other replicas in ring order.
    async fn read_fallthrough(&self, key: &str, replicas: Vec<NodeId>) -> Result<Option<Bytes>> {
        let mut answered = false;

        for node_id in &replicas {
            match self.cluster.get(node_id, key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => answered = true,
                Err(e) => {
                    debug!(node_id = %node_id, key, error = %e, "Replica read failed, trying next");
                }
            }
        }

        if answered {
            Ok(None)
        } else {
            Err(Error::quorum("get", 1, 0))
        }
    }

    /// Add a node to the ring and move keys to their new owners.
    pub async fn add_node(&self, node: HashNode, client: SharedClient) -> Result<RebalanceReport> {
        let mut ring = self.ring.write().await;
        if ring.contains_node(&node.id) {
            return Err(Error::Config(format!("node {} is already a member", node.id)));
        }

        info!(node_id = %node.id, weight = node.weight, "Adding node to ring");
        self.cluster.add_node(node.id.clone(), client);

        let old_ring = ring.clone();
        ring.add_node(node);
        let report = redistribute(&self.cluster, &old_ring, &ring, self.config.factor).await;

        self.metrics.keys_moved.inc_by(report.keys_moved as u64);
        Ok(report)
    }

    /// Move keys off a node, then remove it from the ring.
    pub async fn remove_node(&self, node_id: &str) -> Result<RebalanceReport> {
        let mut ring = self.ring.write().await;
        if !ring.contains_node(node_id) {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        if ring.node_count() == 1 {
            return Err(Error::Config("cannot remove the last node".into()));
        }

        info!(node_id, "Removing node from ring");
        let old_ring = ring.clone();
        ring.remove_node(node_id);
        let report = redistribute(&self.cluster, &old_ring, &ring, self.config.factor).await;

        self.cluster.remove_node(node_id).await?;
        self.metrics.keys_moved.inc_by(report.keys_moved as u64);
        Ok(report)
    }

    /// Wait for every pending secondary write.
    pub async fn flush(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    /// Number of secondary writes still running.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ReplicaPlacement for ReplicationManager {
    async fn replicas_for(&self, key: &str) -> Vec<NodeId> {
        self.replicas(key).await.unwrap_or_default()
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("factor", &self.config.factor)
            .field("consistency", &self.config.consistency)
            .finish()
    }
}
