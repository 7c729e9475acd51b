//! 处理锁 - 同一进程内防止重复处理同一事件
//!
//! Only an optimisation: correctness of assignment comes from the storage
//! compare-and-set, not from these locks.

use std::sync::Arc;

use dashmap::DashSet;

/// `(entity_type, entity_id, event_kind)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub entity_type: String,
    pub entity_id: String,
    pub event_kind: String,
}

impl LockKey {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        event_kind: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            event_kind: event_kind.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingLocks {
    held: Arc<DashSet<LockKey>>,
}

/// Releases its lock on drop (normal return, error, panic or cancellation)
#[derive(Debug)]
pub struct ProcessingGuard {
    key: LockKey,
    held: Arc<DashSet<LockKey>>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

impl ProcessingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if nobody holds it
    pub fn try_acquire(&self, key: LockKey) -> Option<ProcessingGuard> {
        if !self.held.insert(key.clone()) {
            return None;
        }
        Some(ProcessingGuard {
            key,
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.contains(key)
    }

    /// Like [`try_acquire`](Self::try_acquire), logging the skipped event
    ///
    /// The guard may be moved into whatever task finishes the handling.
    pub fn acquire_or_skip(&self, key: LockKey) -> Option<ProcessingGuard> {
        let guard = self.try_acquire(key.clone());
        if guard.is_none() {
            tracing::debug!(
                entity_type = %key.entity_type,
                entity_id = %key.entity_id,
                event_kind = %key.event_kind,
                "Already processing, event skipped"
            );
        }
        guard
    }
}
