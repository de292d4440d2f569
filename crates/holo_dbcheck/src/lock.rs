//! Hierarchical lock manager.
//!
//! Resources form a tree (`Global` > `Database` > `Collection`). Taking a lock
//! on a child first takes the matching intent mode on every ancestor, so a
//! holder of `Global S` (stepdown) excludes every `Global IX` holder (oplog
//! appends) while readers in `IS` keep running.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::types::Namespace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    const ALL: [LockMode; 4] = [
        LockMode::IntentShared,
        LockMode::IntentExclusive,
        LockMode::Shared,
        LockMode::Exclusive,
    ];

    fn index(self) -> usize {
        match self {
            LockMode::IntentShared => 0,
            LockMode::IntentExclusive => 1,
            LockMode::Shared => 2,
            LockMode::Exclusive => 3,
        }
    }

    /// Standard multi-granularity compatibility matrix.
    pub fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match (self, held) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// Mode taken on ancestors when locking a child in `self`.
    pub fn intent(self) -> LockMode {
        match self {
            LockMode::IntentShared | LockMode::Shared => LockMode::IntentShared,
            LockMode::IntentExclusive | LockMode::Exclusive => LockMode::IntentExclusive,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Global,
    Database(String),
    Collection(Namespace),
}

/// Grant counts per mode for one resource.
type Granted = [u32; 4];

#[derive(Default)]
pub struct LockManager {
    granted: Mutex<HashMap<ResourceId, Granted>>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until `mode` on `resource` is compatible with every granted mode.
    pub async fn lock(self: &Arc<Self>, resource: ResourceId, mode: LockMode) -> LockGuard {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await still wakes us.
            notified.as_mut().enable();
            if self.try_grant(&resource, mode) {
                return LockGuard {
                    manager: Arc::clone(self),
                    resource,
                    mode,
                };
            }
            notified.await;
        }
    }

    pub fn try_lock(self: &Arc<Self>, resource: ResourceId, mode: LockMode) -> Option<LockGuard> {
        self.try_grant(&resource, mode).then(|| LockGuard {
            manager: Arc::clone(self),
            resource,
            mode,
        })
    }

    pub async fn lock_global(self: &Arc<Self>, mode: LockMode) -> ScopedLocks {
        let global = self.lock(ResourceId::Global, mode).await;
        ScopedLocks {
            guards: vec![global],
        }
    }

    /// Global intent lock plus `mode` on the database.
    pub async fn lock_database(self: &Arc<Self>, db: &str, mode: LockMode) -> ScopedLocks {
        let global = self.lock(ResourceId::Global, mode.intent()).await;
        let database = self.lock(ResourceId::Database(db.to_string()), mode).await;
        ScopedLocks {
            guards: vec![global, database],
        }
    }

    /// Global and database intent locks plus `mode` on the collection.
    pub async fn lock_collection(self: &Arc<Self>, nss: &Namespace, mode: LockMode) -> ScopedLocks {
        let global = self.lock(ResourceId::Global, mode.intent()).await;
        let database = self
            .lock(ResourceId::Database(nss.db.clone()), mode.intent())
            .await;
        let collection = self.lock(ResourceId::Collection(nss.clone()), mode).await;
        ScopedLocks {
            guards: vec![global, database, collection],
        }
    }

    /// Number of current grants of `mode` on `resource`.
    pub fn granted(&self, resource: &ResourceId, mode: LockMode) -> u32 {
        let granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        granted
            .get(resource)
            .map(|counts| counts[mode.index()])
            .unwrap_or(0)
    }

    fn try_grant(&self, resource: &ResourceId, mode: LockMode) -> bool {
        let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        let counts = granted.entry(resource.clone()).or_default();
        let conflict = LockMode::ALL
            .iter()
            .any(|held| counts[held.index()] > 0 && !mode.compatible_with(*held));
        if conflict {
            return false;
        }
        counts[mode.index()] += 1;
        true
    }

    fn release(&self, resource: &ResourceId, mode: LockMode) {
        {
            let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(counts) = granted.get_mut(resource) {
                counts[mode.index()] = counts[mode.index()].saturating_sub(1);
                if counts.iter().all(|c| *c == 0) {
                    granted.remove(resource);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// One granted lock; released on drop.
pub struct LockGuard {
    manager: Arc<LockManager>,
    resource: ResourceId,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.resource, self.mode);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A root-to-leaf chain of guards, released leaf first.
#[derive(Debug)]
pub struct ScopedLocks {
    guards: Vec<LockGuard>,
}

impl Drop for ScopedLocks {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(IntentShared.compatible_with(IntentExclusive));
        assert!(IntentExclusive.compatible_with(IntentExclusive));
        assert!(Shared.compatible_with(IntentShared));
        assert!(!Shared.compatible_with(IntentExclusive));
        assert!(!IntentExclusive.compatible_with(Shared));
        assert!(!Exclusive.compatible_with(IntentShared));
        assert!(!IntentShared.compatible_with(Exclusive));
    }

    #[tokio::test]
    async fn global_shared_waits_for_intent_exclusive() {
        let locks = LockManager::new();
        let ix = locks.lock_global(LockMode::IntentExclusive).await;
        assert!(locks
            .try_lock(ResourceId::Global, LockMode::Shared)
            .is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _s = locks.lock_global(LockMode::Shared).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(ix);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("shared lock granted after release")
            .unwrap();
        assert_eq!(locks.granted(&ResourceId::Global, LockMode::Shared), 0);
    }

    #[tokio::test]
    async fn collection_lock_takes_intents_on_ancestors() {
        let locks = LockManager::new();
        let nss = Namespace::new("db", "c");
        let scoped = locks.lock_collection(&nss, LockMode::Shared).await;
        assert_eq!(locks.granted(&ResourceId::Global, LockMode::IntentShared), 1);
        assert_eq!(
            locks.granted(&ResourceId::Database("db".into()), LockMode::IntentShared),
            1
        );
        assert_eq!(
            locks.granted(&ResourceId::Collection(nss.clone()), LockMode::Shared),
            1
        );
        // Readers never block a stepdown.
        assert!(locks.try_lock(ResourceId::Global, LockMode::Shared).is_some());
        drop(scoped);
        assert_eq!(locks.granted(&ResourceId::Global, LockMode::IntentShared), 0);
    }
}
