//! Replica-set role and write authority.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::lock::{LockManager, LockMode};
use crate::types::Namespace;

/// Answers whether this process may currently replicate writes.
pub trait ReplicationCoordinator: Send + Sync + 'static {
    fn can_accept_writes_for(&self, nss: &Namespace) -> bool;
    /// Election term stamped on appended entries.
    fn term(&self) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, Debug)]
struct MemberState {
    role: MemberRole,
    term: u64,
}

/// Single replica-set member whose role changes take the global lock in `S`.
///
/// Oplog appends hold `Global IX` across their role check, so a role change
/// can only happen between two appends, never inside one.
pub struct ReplicaSetMember {
    state: RwLock<MemberState>,
    locks: Arc<LockManager>,
}

impl ReplicaSetMember {
    pub fn new(locks: Arc<LockManager>, role: MemberRole, term: u64) -> Self {
        Self {
            state: RwLock::new(MemberState { role, term }),
            locks,
        }
    }

    pub fn primary(locks: Arc<LockManager>) -> Self {
        Self::new(locks, MemberRole::Primary, 1)
    }

    pub fn role(&self) -> MemberRole {
        self.state.read().unwrap_or_else(PoisonError::into_inner).role
    }

    pub async fn step_down(&self) {
        let _global = self.locks.lock_global(LockMode::Shared).await;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.role == MemberRole::Primary {
            state.role = MemberRole::Secondary;
            tracing::info!(term = state.term, "stepped down to secondary");
        }
    }

    pub async fn step_up(&self) {
        let _global = self.locks.lock_global(LockMode::Shared).await;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.role == MemberRole::Secondary {
            state.term += 1;
            state.role = MemberRole::Primary;
            tracing::info!(term = state.term, "stepped up to primary");
        }
    }
}

impl ReplicationCoordinator for ReplicaSetMember {
    fn can_accept_writes_for(&self, nss: &Namespace) -> bool {
        // The local database is never replicated, so it is always writable.
        if nss.is_local() {
            return true;
        }
        self.role() == MemberRole::Primary
    }

    fn term(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).term
    }
}
