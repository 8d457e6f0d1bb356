//! Sync events: the replicated record of every mutation.

use crate::error::Result;
use crate::sync::clock::VersionVector;
use crate::types::{NodeId, SYNC_EVENT_PREFIX};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// Kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEventKind {
    Set,
    Delete,
    Expire,
}

/// A mutation to record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// A value was written.
    Set {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    /// A key was deleted.
    Delete { key: String },
    /// A TTL was set on a key.
    Expire { key: String, ttl: Duration },
}

impl Mutation {
    /// The mutated key.
    pub fn key(&self) -> &str {
        match self {
            Mutation::Set { key, .. } | Mutation::Delete { key } | Mutation::Expire { key, .. } => key,
        }
    }

    /// The event kind.
    pub fn kind(&self) -> SyncEventKind {
        match self {
            Mutation::Set { .. } => SyncEventKind::Set,
            Mutation::Delete { .. } => SyncEventKind::Delete,
            Mutation::Expire { .. } => SyncEventKind::Expire,
        }
    }
}

/// An immutable record of one mutation, broadcast to every backing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// `"{origin}:{incarnation}:{lamport}"`, unique across the cluster and
    /// across restarts of one origin.
    pub id: String,
    pub kind: SyncEventKind,
    pub key: String,
    /// Serialized value for `Set`.
    pub value: Option<Vec<u8>>,
    /// TTL in milliseconds, relative to `timestamp`.
    pub ttl_ms: Option<u64>,
    /// Wall-clock time (ms) at the origin.
    pub timestamp: u64,
    /// Lamport time at the origin.
    pub lamport: u64,
    /// Process that recorded the event.
    pub origin: NodeId,
    /// Run of the origin process that recorded the event.
    #[serde(default)]
    pub incarnation: String,
    /// Origin's version vector after the event.
    pub version: VersionVector,
}

impl SyncEvent {
    /// Build an event for a mutation.
    pub fn from_mutation(
        mutation: Mutation,
        origin: NodeId,
        timestamp: u64,
        lamport: u64,
        version: VersionVector,
    ) -> Self {
        let kind = mutation.kind();
        let (key, value, ttl_ms) = match mutation {
            Mutation::Set { key, value, ttl } => {
                (key, Some(value.to_vec()), ttl.map(|d| d.as_millis() as u64))
            }
            Mutation::Delete { key } => (key, None, None),
            Mutation::Expire { key, ttl } => (key, None, Some(ttl.as_millis() as u64)),
        };

        Self {
            id: format!("{}:{}", origin, lamport),
            kind,
            key,
            value,
            ttl_ms,
            timestamp,
            lamport,
            origin,
            incarnation: String::new(),
            version,
        }
    }

    /// Tag the event with the run of the process that recorded it.
    pub fn with_incarnation(mut self, incarnation: impl Into<String>) -> Self {
        self.incarnation = incarnation.into();
        self.id = format!("{}:{}:{}", self.origin, self.incarnation, self.lamport);
        self
    }

    /// Key under which the event is stored on backing nodes.
    ///
    /// The timestamp comes first so cleanup can age events without
    /// reading them.
    pub fn storage_key(&self) -> String {
        format!("{}{}:{}", SYNC_EVENT_PREFIX, self.timestamp, self.id)
    }

    /// Timestamp encoded in a storage key.
    pub fn timestamp_from_storage_key(storage_key: &str) -> Option<u64> {
        storage_key
            .strip_prefix(SYNC_EVENT_PREFIX)?
            .split_once(':')?
            .0
            .parse()
            .ok()
    }

    /// JSON encoding stored on backing nodes.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode an event read from a backing node.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// TTL left at `now_ms`. `None` if the mutation had no TTL.
    pub fn remaining_ttl(&self, now_ms: u64) -> Option<Duration> {
        self.ttl_ms.map(|ttl| {
            let elapsed = now_ms.saturating_sub(self.timestamp);
            Duration::from_millis(ttl.saturating_sub(elapsed))
        })
    }

    /// Last-write-wins order: timestamp, then Lamport time, then origin.
    pub fn lww_cmp(&self, other: &SyncEvent) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.lamport.cmp(&other.lamport))
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(origin: &str, timestamp: u64, lamport: u64) -> SyncEvent {
        SyncEvent::from_mutation(
            Mutation::Set {
                key: "k".into(),
                value: Bytes::from("1"),
                ttl: Some(Duration::from_secs(10)),
            },
            origin.to_string(),
            timestamp,
            lamport,
            VersionVector::new(),
        )
    }

    #[test]
    fn test_event_identity_and_storage_key() {
        let e = event("10.0.0.1:6379", 1_700_000_000_000, 4);
        assert_eq!(e.id, "10.0.0.1:6379:4");
        assert_eq!(e.kind, SyncEventKind::Set);
        assert_eq!(e.ttl_ms, Some(10_000));

        let key = e.storage_key();
        assert!(key.starts_with(SYNC_EVENT_PREFIX));
        assert_eq!(SyncEvent::timestamp_from_storage_key(&key), Some(1_700_000_000_000));
        assert_eq!(SyncEvent::timestamp_from_storage_key("user:1"), None);
    }

    #[test]
    fn test_encoding_is_json() {
        let e = event("a", 5, 1);
        let encoded = e.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["kind"], "set");
        assert_eq!(SyncEvent::decode(&encoded).unwrap(), e);
        assert!(SyncEvent::decode(b"not json").is_err());
    }

    #[test]
    fn test_incarnation_separates_restarted_origins() {
        let first = event("app-1", 100, 1).with_incarnation("run-a");
        let second = event("app-1", 200, 1).with_incarnation("run-b");
        assert_eq!(first.id, "app-1:run-a:1");
        assert_ne!(first.id, second.id);
        assert_ne!(first.storage_key(), second.storage_key());
        assert_eq!(SyncEvent::timestamp_from_storage_key(&second.storage_key()), Some(200));
    }

    #[test]
    fn test_remaining_ttl() {
        let e = event("a", 1_000, 1);
        assert_eq!(e.remaining_ttl(4_000), Some(Duration::from_secs(7)));
        assert_eq!(e.remaining_ttl(20_000), Some(Duration::ZERO));
    }

    #[test]
    fn test_lww_order() {
        let early = event("b", 100, 9);
        let late = event("a", 200, 1);
        assert_eq!(early.lww_cmp(&late), Ordering::Less);

        // Equal timestamps fall back to Lamport time, then origin.
        let x = event("a", 100, 2);
        let y = event("b", 100, 3);
        assert_eq!(x.lww_cmp(&y), Ordering::Less);
        let z = event("c", 100, 3);
        assert_eq!(y.lww_cmp(&z), Ordering::Less);
    }
}
