//! Anti-entropy: event recording, broadcast, and replica repair.

use crate::cluster::{ClusterEvent, ClusterManager};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::metrics::CacheMetrics;
use crate::sync::clock::{Clock, LamportClock, VersionVector};
use crate::sync::event::{Mutation, SyncEvent, SyncEventKind};
use crate::sync::locks::KeyLocks;
use crate::sync::resolver::{resolve, Resolution};
use crate::types::{NodeId, SyncStatus, SYNC_EVENT_PREFIX};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Capacity of the notification channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// Keys fetched per batch when collecting events.
const COLLECT_BATCH_SIZE: usize = 128;

/// Current replica set of a key.
#[async_trait]
pub trait ReplicaPlacement: Send + Sync + 'static {
    /// Nodes that should hold `key`, primary first.
    async fn replicas_for(&self, key: &str) -> Vec<NodeId>;
}

/// Notifications published by the [`SyncCoordinator`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// A winning event was reapplied, or a real conflict was resolved.
    EventApplied {
        key: String,
        event_id: String,
        repaired: usize,
    },

    /// A backing node failed a health check.
    NodeFailure { node_id: NodeId, error: String },

    /// A backing node answered again after failing.
    NodeRecovered { node_id: NodeId },
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Distinct events collected from nodes and the local log.
    pub events_collected: usize,
    /// Keys examined.
    pub keys: usize,
    /// Keys whose events came from more than one origin.
    pub conflicts: usize,
    /// Replicas rewritten.
    pub repairs: usize,
    /// Node calls that failed during the pass.
    pub failures: usize,
    /// Time spent.
    pub duration: Duration,
}

/// An event in the local log and when this process recorded it.
#[derive(Debug, Clone)]
struct LoggedEvent {
    event: SyncEvent,
    recorded: Instant,
}

/// Resets the single-flight flag when a pass ends, even on early return.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Records mutations as events and reconciles divergent replicas.
///
/// Every mutation becomes a [`SyncEvent`] stamped with wall-clock time, a
/// Lamport value and this process's version vector. Events are written to
/// every backing node under the reserved prefix. A synchronization pass
/// gathers them, picks a winner per key and rewrites replicas that
/// disagree with it.
pub struct SyncCoordinator {
    /// This process's id, stamped on every event.
    node_id: NodeId,

    /// Random id of this process instance, part of every event id.
    incarnation: String,

    /// Backing-node connections.
    cluster: Arc<ClusterManager>,

    /// Replica sets.
    placement: Arc<dyn ReplicaPlacement>,

    /// Sync settings.
    config: SyncConfig,

    /// Wall clock.
    clock: Arc<dyn Clock>,

    /// Logical clock.
    lamport: LamportClock,

    /// Version vector, merged with every observed event.
    version: Mutex<VersionVector>,

    /// Events recorded by this process, per key. Entries live as long as
    /// their broadcast copies.
    log: RwLock<HashMap<String, Vec<LoggedEvent>>>,

    /// Orders local mutations against replica repair.
    key_locks: KeyLocks,

    /// Single-flight flag for `synchronize`.
    in_progress: AtomicBool,

    /// Wall-clock time of the last completed pass.
    last_sync: RwLock<Option<u64>>,

    /// Wakes the background loop.
    trigger: Notify,

    /// Notification publisher.
    notifications: broadcast::Sender<SyncNotification>,

    /// In-flight event broadcasts.
    broadcasts: TaskTracker,

    /// Shared counters.
    metrics: Arc<CacheMetrics>,
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        node_id: NodeId,
        cluster: Arc<ClusterManager>,
        placement: Arc<dyn ReplicaPlacement>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            node_id,
            incarnation: uuid::Uuid::new_v4().simple().to_string(),
            cluster,
            placement,
            config,
            clock,
            lamport: LamportClock::new(),
            version: Mutex::new(VersionVector::new()),
            log: RwLock::new(HashMap::new()),
            key_locks: KeyLocks::default(),
            in_progress: AtomicBool::new(false),
            last_sync: RwLock::new(None),
            trigger: Notify::new(),
            notifications,
            broadcasts: TaskTracker::new(),
            metrics,
        }
    }

    /// This process's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Id of this process instance.
    pub fn incarnation(&self) -> &str {
        &self.incarnation
    }

    /// Per-key locks. Hold a key shared from its first replica write until
    /// its event is recorded.
    pub fn key_locks(&self) -> &KeyLocks {
        &self.key_locks
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: SyncNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Ask the background loop for a pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Record a mutation and broadcast it to every backing node.
    pub fn record_event(&self, mutation: Mutation) -> Result<SyncEvent> {
        let event = {
            let mut version = self.version.lock();
            version.increment(&self.node_id);
            SyncEvent::from_mutation(
                mutation,
                self.node_id.clone(),
                self.clock.now_ms(),
                self.lamport.tick(),
                version.clone(),
            )
            .with_incarnation(self.incarnation.as_str())
        };
        let encoded = event.encode()?;

        self.log
            .write()
            .entry(event.key.clone())
            .or_default()
            .push(LoggedEvent {
                event: event.clone(),
                recorded: Instant::now(),
            });
        self.metrics.events_recorded.inc();
        trace!(event_id = %event.id, key = %event.key, kind = ?event.kind, "Recorded sync event");

        let cluster = self.cluster.clone();
        let storage_key = event.storage_key();
        let ttl = self.config.event_ttl;
        self.broadcasts.spawn(async move {
            for node_id in cluster.node_ids() {
                if let Err(e) = cluster.set(&node_id, &storage_key, encoded.clone(), Some(ttl)).await {
                    warn!(node_id = %node_id, key = %storage_key, error = %e, "Failed to broadcast sync event");
                }
            }
        });

        if self.config.sync_on_event {
            self.trigger();
        }
        Ok(event)
    }

    /// Run one anti-entropy pass.
    ///
    /// Returns `Ok(None)` without doing anything if a pass is already running.
    pub async fn synchronize(&self) -> Result<Option<SyncReport>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Synchronization already in progress");
            return Ok(None);
        }
        let _guard = FlightGuard(&self.in_progress);

        let started = Instant::now();
        let mut report = SyncReport::default();

        let events = self.collect_events(&mut report).await;
        report.events_collected = events.len();
        self.observe(&events);

        let mut by_key: HashMap<String, Vec<SyncEvent>> = HashMap::new();
        for event in events {
            by_key.entry(event.key.clone()).or_default().push(event);
        }
        report.keys = by_key.len();

        let mut keys: Vec<String> = by_key.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let Some(mut group) = by_key.remove(&key) else {
                continue;
            };
            group.sort_by(|a, b| a.lww_cmp(b));

            let Some(resolution) = resolve(&self.config.strategy, &key, &group) else {
                continue;
            };
            if resolution.conflict {
                report.conflicts += 1;
                self.metrics.sync_conflicts.inc();
            }

            let repaired = self.apply(&key, &resolution, &group, &mut report).await;
            report.repairs += repaired;

            if repaired > 0 || resolution.conflict {
                self.notify(SyncNotification::EventApplied {
                    key: key.clone(),
                    event_id: resolution.winner.id.clone(),
                    repaired,
                });
            }
        }

        *self.last_sync.write() = Some(self.clock.now_ms());
        self.metrics.sync_passes.inc();
        report.duration = started.elapsed();

        debug!(
            events = report.events_collected,
            keys = report.keys,
            conflicts = report.conflicts,
            repairs = report.repairs,
            failures = report.failures,
            "Synchronization pass complete"
        );
        Ok(Some(report))
    }

    /// Gather every event from every node and the local log, deduplicated.
    async fn collect_events(&self, report: &mut SyncReport) -> Vec<SyncEvent> {
        let mut events: HashMap<String, SyncEvent> = HashMap::new();
        let mut fetched: HashSet<String> = HashSet::new();

        for node_id in self.cluster.node_ids() {
            let keys = match self.cluster.keys(&node_id, SYNC_EVENT_PREFIX).await {
                Ok(keys) => keys,
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Failed to list sync events");
                    report.failures += 1;
                    continue;
                }
            };

            let unseen: Vec<String> = keys.into_iter().filter(|k| !fetched.contains(k)).collect();
            for batch in unseen.chunks(COLLECT_BATCH_SIZE) {
                let values = match self.cluster.mget(&node_id, batch).await {
                    Ok(values) => values,
                    Err(e) => {
                        debug!(node_id = %node_id, error = %e, "Failed to read sync events");
                        report.failures += 1;
                        continue;
                    }
                };

                for (storage_key, value) in batch.iter().zip(values) {
                    // Expired between listing and reading.
                    let Some(data) = value else {
                        continue;
                    };
                    fetched.insert(storage_key.clone());
                    match SyncEvent::decode(&data) {
                        Ok(event) => {
                            events.entry(event.id.clone()).or_insert(event);
                        }
                        Err(e) => {
                            warn!(key = %storage_key, error = %e, "Skipping undecodable sync event");
                        }
                    }
                }
            }
        }

        self.prune_log();
        for logged in self.log.read().values().flatten() {
            events
                .entry(logged.event.id.clone())
                .or_insert_with(|| logged.event.clone());
        }

        events.into_values().collect()
    }

    /// Drop local events whose broadcast copies have expired.
    fn prune_log(&self) {
        let ttl = self.config.event_ttl;
        let mut log = self.log.write();
        for events in log.values_mut() {
            events.retain(|logged| logged.recorded.elapsed() < ttl);
        }
        log.retain(|_, events| !events.is_empty());
    }

    /// Seed the logical clocks from events already on the nodes.
    ///
    /// Call before the first mutation so a restarted process continues
    /// from the Lamport time and version counters of its predecessors.
    /// Returns the number of events observed.
    pub async fn restore_clocks(&self) -> usize {
        let mut report = SyncReport::default();
        let events = self.collect_events(&mut report).await;
        self.observe(&events);

        if report.failures > 0 {
            warn!(failures = report.failures, "Some nodes were unreachable while restoring clocks");
        }
        debug!(
            events = events.len(),
            lamport = self.lamport.current(),
            "Restored logical clocks"
        );
        events.len()
    }

    /// Whether this process recorded an event for `key` that `group` lacks.
    fn superseded(&self, key: &str, group: &[SyncEvent]) -> bool {
        let log = self.log.read();
        let Some(events) = log.get(key) else {
            return false;
        };
        let known: HashSet<&str> = group.iter().map(|e| e.id.as_str()).collect();
        events.iter().any(|logged| !known.contains(logged.event.id.as_str()))
    }

    /// Merge observed logical clocks into ours.
    fn observe(&self, events: &[SyncEvent]) {
        let mut version = self.version.lock();
        for event in events {
            self.lamport.observe(event.lamport);
            version.merge(&event.version);
        }
    }

    /// Rewrite every replica of `key` that disagrees with the winner.
    async fn apply(
        &self,
        key: &str,
        resolution: &Resolution,
        group: &[SyncEvent],
        report: &mut SyncReport,
    ) -> usize {
        let winner = &resolution.winner;
        let now = self.clock.now_ms();
        let mut repaired = 0;

        for node_id in self.placement.replicas_for(key).await {
            let _guard = self.key_locks.exclusive(key).await;
            // A local write landed after collection; the next pass resolves it.
            if self.superseded(key, group) {
                trace!(key, event_id = %winner.id, "Skipping repair, newer local event");
                break;
            }

            match self.repair_replica(&node_id, key, winner, group, now).await {
                Ok(true) => {
                    repaired += 1;
                    self.metrics.sync_repairs.inc();
                    debug!(node_id = %node_id, key, event_id = %winner.id, "Repaired replica");
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(node_id = %node_id, key, error = %e, "Failed to repair replica");
                    report.failures += 1;
                }
            }
        }

        repaired
    }

    /// Returns whether the replica was rewritten.
    async fn repair_replica(
        &self,
        node_id: &str,
        key: &str,
        winner: &SyncEvent,
        group: &[SyncEvent],
        now: u64,
    ) -> Result<bool> {
        match winner.kind {
            SyncEventKind::Set => {
                let ttl = winner.remaining_ttl(now);
                // Already expired everywhere it matters.
                if ttl == Some(Duration::ZERO) {
                    return Ok(false);
                }
                let Some(value) = winner.value.as_deref() else {
                    return Ok(false);
                };

                if self.cluster.get(node_id, key).await?.as_deref() == Some(value) {
                    return Ok(false);
                }
                self.cluster
                    .set(node_id, key, Bytes::copy_from_slice(value), ttl)
                    .await?;
                Ok(true)
            }
            SyncEventKind::Delete => {
                if self.cluster.get(node_id, key).await?.is_none() {
                    return Ok(false);
                }
                self.cluster.del(node_id, key).await?;
                Ok(true)
            }
            SyncEventKind::Expire => {
                let ttl = winner.remaining_ttl(now).unwrap_or(Duration::ZERO);

                match self.cluster.get_with_ttl(node_id, key).await? {
                    Some(entry) if entry.ttl_ms.is_some() => Ok(false),
                    Some(_) if ttl.is_zero() => {
                        self.cluster.del(node_id, key).await?;
                        Ok(true)
                    }
                    Some(_) => {
                        self.cluster.expire(node_id, key, ttl).await?;
                        Ok(true)
                    }
                    None if ttl.is_zero() => Ok(false),
                    None => {
                        // Re-seed from the last write preceding the expire.
                        let Some(value) = value_before(group, winner) else {
                            return Ok(false);
                        };
                        self.cluster
                            .set(node_id, key, Bytes::copy_from_slice(value), Some(ttl))
                            .await?;
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Delete broadcast events older than the retention period.
    ///
    /// Also prunes the local log. Returns the number of deletions.
    pub async fn cleanup_events(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.config.retention.as_millis() as u64);
        let mut removed = 0;

        for node_id in self.cluster.node_ids() {
            let keys = match self.cluster.keys(&node_id, SYNC_EVENT_PREFIX).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Failed to list sync events for cleanup");
                    continue;
                }
            };

            for storage_key in keys {
                let timestamp = match SyncEvent::timestamp_from_storage_key(&storage_key) {
                    Some(ts) => ts,
                    None => match self.cluster.get(&node_id, &storage_key).await {
                        Ok(Some(data)) => match SyncEvent::decode(&data) {
                            Ok(event) => event.timestamp,
                            Err(_) => continue,
                        },
                        _ => continue,
                    },
                };

                if timestamp >= cutoff {
                    continue;
                }
                match self.cluster.del(&node_id, &storage_key).await {
                    Ok(_) => removed += 1,
                    Err(e) => {
                        warn!(node_id = %node_id, key = %storage_key, error = %e, "Failed to delete expired sync event");
                    }
                }
            }
        }

        {
            let mut log = self.log.write();
            let ttl = self.config.event_ttl;
            for events in log.values_mut() {
                events.retain(|logged| logged.event.timestamp >= cutoff && logged.recorded.elapsed() < ttl);
            }
            log.retain(|_, events| !events.is_empty());
        }

        self.metrics.events_cleaned.inc_by(removed as u64);
        if removed > 0 {
            info!(removed, "Expired sync events cleaned up");
        }
        Ok(removed)
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            in_progress: self.in_progress.load(Ordering::Acquire),
            last_sync: *self.last_sync.read(),
            event_count: self
                .log
                .read()
                .values()
                .flatten()
                .filter(|logged| logged.recorded.elapsed() < self.config.event_ttl)
                .count(),
        }
    }

    /// Events in the local log for `key`, oldest first by LWW order.
    pub fn events_for(&self, key: &str) -> Vec<SyncEvent> {
        let ttl = self.config.event_ttl;
        let mut events: Vec<SyncEvent> = self
            .log
            .read()
            .get(key)
            .map(|logged| {
                logged
                    .iter()
                    .filter(|l| l.recorded.elapsed() < ttl)
                    .map(|l| l.event.clone())
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by(|a, b| a.lww_cmp(b));
        events
    }

    /// Current Lamport time.
    pub fn lamport_time(&self) -> u64 {
        self.lamport.current()
    }

    /// Wait for every in-flight broadcast.
    pub async fn flush(&self) {
        self.broadcasts.close();
        self.broadcasts.wait().await;
        self.broadcasts.reopen();
    }

    fn on_cluster_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::NodeError { node_id, error } => {
                self.notify(SyncNotification::NodeFailure { node_id, error });
                self.trigger();
            }
            ClusterEvent::NodeRecovered { node_id } => {
                self.notify(SyncNotification::NodeRecovered { node_id });
                self.trigger();
            }
            ClusterEvent::NodeAdded { .. } | ClusterEvent::NodeRemoved { .. } => {}
        }
    }

    async fn run_pass(&self, reason: &'static str) {
        match self.synchronize().await {
            Ok(Some(report)) => trace!(reason, repairs = report.repairs, "Background sync pass"),
            Ok(None) => trace!(reason, "Skipped sync pass, one is already running"),
            Err(e) => warn!(reason, error = %e, "Background sync pass failed"),
        }
    }

    /// Background loop: periodic and triggered passes, cluster events and
    /// cleanup. Runs until `token` is cancelled.
    pub async fn run(self: Arc<Self>, sync_interval: Duration, token: CancellationToken) {
        let start = tokio::time::Instant::now();
        let mut sync_tick = tokio::time::interval_at(start + sync_interval, sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cleanup_interval = self.config.cleanup_interval;
        let mut cleanup_tick = tokio::time::interval_at(start + cleanup_interval, cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cluster_events = self.cluster.subscribe();
        let mut cluster_open = true;

        info!(node_id = %self.node_id, interval = ?sync_interval, strategy = self.config.strategy.name(), "Sync coordinator started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sync_tick.tick() => self.run_pass("interval").await,
                _ = self.trigger.notified() => self.run_pass("trigger").await,
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.cleanup_events().await {
                        warn!(error = %e, "Sync event cleanup failed");
                    }
                }
                event = cluster_events.recv(), if cluster_open => match event {
                    Ok(event) => self.on_cluster_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync coordinator lagged behind cluster events");
                        self.trigger();
                    }
                    Err(RecvError::Closed) => cluster_open = false,
                },
            }
        }
        info!(node_id = %self.node_id, "Sync coordinator stopped");
    }
}

/// Value of the latest `Set` preceding `winner` with no `Delete` after it.
fn value_before<'a>(group: &'a [SyncEvent], winner: &SyncEvent) -> Option<&'a [u8]> {
    group
        .iter()
        .filter(|e| e.lww_cmp(winner).is_lt())
        .rev()
        .find(|e| e.kind != SyncEventKind::Expire)
        .filter(|e| e.kind == SyncEventKind::Set)
        .and_then(|e| e.value.as_deref())
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("node_id", &self.node_id)
            .field("strategy", &self.config.strategy)
            .finish()
    }
}
