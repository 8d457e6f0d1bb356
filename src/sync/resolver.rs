//! Conflict resolution between competing events for one key.

use crate::sync::clock::Causality;
use crate::sync::event::SyncEvent;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Caller-supplied resolution of a conflict set.
pub trait ConflictResolver: Send + Sync + 'static {
    /// Pick the winner among `events` for `key`, or `None` to defer to
    /// last-write-wins.
    fn resolve<'a>(&self, key: &str, events: &'a [SyncEvent]) -> Option<&'a SyncEvent>;
}

/// How competing events for one key are resolved.
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// Latest wall-clock timestamp wins; ties go to the higher Lamport
    /// time, then to the higher origin id.
    #[default]
    LastWriteWins,

    /// The causally latest event wins. Concurrent events go to `fallback`,
    /// or without one to the event whose origin has the latest timestamp.
    VersionVector {
        fallback: Option<Arc<dyn ConflictResolver>>,
    },

    /// A caller-supplied resolver sees every conflict.
    Custom(Arc<dyn ConflictResolver>),
}

impl ConflictStrategy {
    /// Version-vector resolution without a fallback resolver.
    pub fn version_vector() -> Self {
        ConflictStrategy::VersionVector { fallback: None }
    }

    /// Strategy name.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::VersionVector { .. } => "version-vector",
            ConflictStrategy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::VersionVector { fallback } => f
                .debug_struct("VersionVector")
                .field("fallback", &fallback.is_some())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// The winning event for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Event to reapply.
    pub winner: SyncEvent,
    /// Whether events from more than one origin competed.
    pub conflict: bool,
}

/// Pick the winner among `events` (non-empty) for `key`.
pub fn resolve(strategy: &ConflictStrategy, key: &str, events: &[SyncEvent]) -> Option<Resolution> {
    let origins: BTreeSet<&str> = events.iter().map(|e| e.origin.as_str()).collect();
    let conflict = origins.len() > 1;

    let winner = match strategy {
        ConflictStrategy::LastWriteWins => last_write_wins(events),
        ConflictStrategy::VersionVector { fallback } => {
            let frontier = causal_frontier(events);
            if frontier.len() == 1 {
                frontier.first().copied()
            } else {
                fallback
                    .as_ref()
                    .and_then(|resolver| resolver.resolve(key, events))
                    .or_else(|| latest_origin(&frontier))
            }
        }
        ConflictStrategy::Custom(resolver) => resolver
            .resolve(key, events)
            .or_else(|| last_write_wins(events)),
    }?;

    Some(Resolution {
        winner: winner.clone(),
        conflict,
    })
}

fn last_write_wins(events: &[SyncEvent]) -> Option<&SyncEvent> {
    events.iter().max_by(|a, b| a.lww_cmp(b))
}

/// Events not causally preceded by any other event.
fn causal_frontier(events: &[SyncEvent]) -> Vec<&SyncEvent> {
    events
        .iter()
        .filter(|candidate| {
            !events
                .iter()
                .any(|other| candidate.version.compare(&other.version) == Causality::Before)
        })
        .collect()
}

/// Score each origin by the latest timestamp it produced; the best-scored
/// origin's latest event wins.
fn latest_origin<'a>(events: &[&'a SyncEvent]) -> Option<&'a SyncEvent> {
    let mut scores: HashMap<&str, u64> = HashMap::new();
    for event in events {
        let score = scores.entry(event.origin.as_str()).or_insert(0);
        *score = (*score).max(event.timestamp);
    }

    events
        .iter()
        .copied()
        .max_by(|a, b| {
            scores[a.origin.as_str()]
                .cmp(&scores[b.origin.as_str()])
                .then_with(|| a.lww_cmp(b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::VersionVector;
    use crate::sync::event::Mutation;
    use bytes::Bytes;

    fn set_event(origin: &str, value: &str, timestamp: u64, lamport: u64, version: VersionVector) -> SyncEvent {
        SyncEvent::from_mutation(
            Mutation::Set {
                key: "k".into(),
                value: Bytes::from(value.to_string()),
                ttl: None,
            },
            origin.to_string(),
            timestamp,
            lamport,
            version,
        )
    }

    fn vv(entries: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (node, count) in entries {
            for _ in 0..*count {
                v.increment(node);
            }
        }
        v
    }

    #[test]
    fn test_lww_picks_later_timestamp() {
        let events = vec![
            set_event("a", "old", 100, 5, VersionVector::new()),
            set_event("b", "new", 200, 1, VersionVector::new()),
        ];

        let resolution = resolve(&ConflictStrategy::LastWriteWins, "k", &events).unwrap();
        assert_eq!(resolution.winner.value.as_deref(), Some(&b"new"[..]));
        assert!(resolution.conflict);
    }

    #[test]
    fn test_lww_tie_broken_by_lamport() {
        let events = vec![
            set_event("b", "first", 100, 7, VersionVector::new()),
            set_event("a", "second", 100, 8, VersionVector::new()),
        ];

        let resolution = resolve(&ConflictStrategy::LastWriteWins, "k", &events).unwrap();
        assert_eq!(resolution.winner.lamport, 8);

        // Order of arrival does not matter.
        let reversed: Vec<SyncEvent> = events.into_iter().rev().collect();
        let resolution = resolve(&ConflictStrategy::LastWriteWins, "k", &reversed).unwrap();
        assert_eq!(resolution.winner.lamport, 8);
    }

    #[test]
    fn test_single_origin_is_not_a_conflict() {
        let events = vec![
            set_event("a", "1", 100, 1, vv(&[("a", 1)])),
            set_event("a", "2", 150, 2, vv(&[("a", 2)])),
        ];
        let resolution = resolve(&ConflictStrategy::LastWriteWins, "k", &events).unwrap();
        assert!(!resolution.conflict);
        assert_eq!(resolution.winner.lamport, 2);
    }

    #[test]
    fn test_version_vector_causal_winner() {
        // b saw a's write, so b's write wins despite the older timestamp.
        let events = vec![
            set_event("a", "first", 500, 1, vv(&[("a", 1)])),
            set_event("b", "second", 100, 2, vv(&[("a", 1), ("b", 1)])),
        ];

        let resolution = resolve(&ConflictStrategy::version_vector(), "k", &events).unwrap();
        assert_eq!(resolution.winner.origin, "b");
    }

    struct PreferOrigin(&'static str);

    impl ConflictResolver for PreferOrigin {
        fn resolve<'a>(&self, _key: &str, events: &'a [SyncEvent]) -> Option<&'a SyncEvent> {
            events.iter().find(|e| e.origin == self.0)
        }
    }

    #[test]
    fn test_version_vector_concurrent_uses_fallback() {
        let events = vec![
            set_event("a", "from-a", 100, 1, vv(&[("a", 1)])),
            set_event("b", "from-b", 900, 1, vv(&[("b", 1)])),
        ];

        let strategy = ConflictStrategy::VersionVector {
            fallback: Some(Arc::new(PreferOrigin("a"))),
        };
        let resolution = resolve(&strategy, "k", &events).unwrap();
        assert_eq!(resolution.winner.origin, "a");

        // Without a fallback the origin with the latest timestamp wins.
        let resolution = resolve(&ConflictStrategy::version_vector(), "k", &events).unwrap();
        assert_eq!(resolution.winner.origin, "b");
    }

    #[test]
    fn test_custom_falls_back_to_lww() {
        let events = vec![
            set_event("a", "x", 100, 1, VersionVector::new()),
            set_event("b", "y", 200, 2, VersionVector::new()),
        ];

        let prefer_a = ConflictStrategy::Custom(Arc::new(PreferOrigin("a")));
        assert_eq!(resolve(&prefer_a, "k", &events).unwrap().winner.origin, "a");

        let prefer_none = ConflictStrategy::Custom(Arc::new(PreferOrigin("zzz")));
        assert_eq!(resolve(&prefer_none, "k", &events).unwrap().winner.origin, "b");
    }

    #[test]
    fn test_strategy_debug() {
        assert_eq!(format!("{:?}", ConflictStrategy::LastWriteWins), "last-write-wins");
        assert!(format!("{:?}", ConflictStrategy::version_vector()).contains("fallback: false"));
    }
}
