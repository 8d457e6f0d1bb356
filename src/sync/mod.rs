//! Anti-entropy between replicas.
//!
//! Every mutation is recorded as a [`SyncEvent`] and broadcast to all
//! backing nodes. The [`SyncCoordinator`] periodically gathers those
//! events, resolves competing writes with a [`ConflictStrategy`] and
//! rewrites replicas that diverged.

pub mod clock;
pub mod coordinator;
pub mod event;
pub mod locks;
pub mod resolver;

pub use clock::{Causality, Clock, LamportClock, ManualClock, SkewedClock, SystemClock, VersionVector};
pub use coordinator::{ReplicaPlacement, SyncCoordinator, SyncNotification, SyncReport};
pub use event::{Mutation, SyncEvent, SyncEventKind};
pub use locks::KeyLocks;
pub use resolver::{resolve, ConflictResolver, ConflictStrategy, Resolution};
