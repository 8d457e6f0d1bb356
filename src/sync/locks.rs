//! Striped per-key locks ordering local mutations against replica repair.
//!
//! A mutation holds its key's stripe shared from the first replica write
//! until its sync event is recorded. A repair holds the stripe exclusively
//! while it checks for newer local events and rewrites one replica, so it
//! can never land between a mutation's writes and its event.

use std::hash::Hasher;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use twox_hash::XxHash64;

/// Default number of stripes.
pub const DEFAULT_KEY_LOCK_STRIPES: usize = 256;

/// A fixed set of async read-write locks indexed by key hash.
pub struct KeyLocks {
    stripes: Box<[RwLock<()>]>,
}

impl KeyLocks {
    /// Create `stripes` locks (at least one).
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| RwLock::new(())).collect(),
        }
    }

    fn index(&self, key: &str) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.as_bytes());
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Hold a key while mutating it.
    pub async fn shared(&self, key: &str) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.index(key)].read().await
    }

    /// Hold several keys while mutating them.
    ///
    /// Stripes are taken once each, in ascending order.
    pub async fn shared_many<'a, I>(&'a self, keys: I) -> Vec<RwLockReadGuard<'a, ()>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut indexes: Vec<usize> = keys.into_iter().map(|k| self.index(k.as_ref())).collect();
        indexes.sort_unstable();
        indexes.dedup();

        let mut guards = Vec::with_capacity(indexes.len());
        for index in indexes {
            guards.push(self.stripes[index].read().await);
        }
        guards
    }

    /// Hold a key while repairing it.
    pub async fn exclusive(&self, key: &str) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.index(key)].write().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_LOCK_STRIPES)
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
