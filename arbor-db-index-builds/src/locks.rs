//! Collection locks and the replication state transition lock
//!
//! Every lock wait here is bounded. The deadlock this exists to prevent: an
//! index build holding an exclusive collection lock while a step-up/step-down
//! is queued behind it, with the step blocking whatever the build is waiting
//! on. Phases therefore take the state-transition lock shared (enqueue-only,
//! short timeout) *before* the collection lock; on timeout they release
//! everything and retry the phase from scratch.
//!
//! Guards are owned (`read_owned`/`write_owned`) so they can be held across
//! await points. tokio's `RwLock` is write-preferring and FIFO, which gives
//! an exclusive waiter true enqueue semantics against later readers.

use crate::error::{IndexBuildError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

/// A held collection lock
#[derive(Debug)]
pub struct CollectionLock {
    _guard: CollectionGuard,
}

#[derive(Debug)]
enum CollectionGuard {
    Exclusive(OwnedRwLockWriteGuard<()>),
    Intent(OwnedRwLockReadGuard<()>),
}

/// A held shared pass through the replication-state-transition lock:
/// no step-up/step-down runs while this guard lives.
#[derive(Debug)]
pub struct StateTransitionGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

/// In-process lock manager for collections and replication state transitions
#[derive(Default)]
pub struct LockManager {
    collections: Mutex<FxHashMap<Uuid, Arc<RwLock<()>>>>,
    state_transition: Arc<RwLock<()>>,
}

impl LockManager {
    /// New lock manager
    pub fn new() -> Self {
        Self::default()
    }

    fn collection_handle(&self, collection_id: Uuid) -> Arc<RwLock<()>> {
        self.collections
            .lock()
            .entry(collection_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive collection lock: excludes all other writers and readers
    pub async fn collection_exclusive(
        &self,
        collection_id: Uuid,
        timeout: Duration,
    ) -> Result<CollectionLock> {
        let handle = self.collection_handle(collection_id);
        match tokio::time::timeout(timeout, handle.write_owned()).await {
            Ok(guard) => Ok(CollectionLock {
                _guard: CollectionGuard::Exclusive(guard),
            }),
            Err(_) => Err(IndexBuildError::LockTimeout("collection")),
        }
    }

    /// Intent collection lock: coexists with foreground traffic, excludes
    /// exclusive holders
    pub async fn collection_intent(
        &self,
        collection_id: Uuid,
        timeout: Duration,
    ) -> Result<CollectionLock> {
        let handle = self.collection_handle(collection_id);
        match tokio::time::timeout(timeout, handle.read_owned()).await {
            Ok(guard) => Ok(CollectionLock {
                _guard: CollectionGuard::Intent(guard),
            }),
            Err(_) => Err(IndexBuildError::LockTimeout("collection")),
        }
    }

    /// Enqueue behind any in-flight replication state transition, bounded.
    ///
    /// Holding the returned guard keeps step-up/step-down out until dropped.
    pub async fn state_transition_shared(&self, timeout: Duration) -> Result<StateTransitionGuard> {
        let handle = self.state_transition.clone();
        match tokio::time::timeout(timeout, handle.read_owned()).await {
            Ok(guard) => Ok(StateTransitionGuard { _guard: guard }),
            Err(_) => Err(IndexBuildError::LockTimeout("replication state transition")),
        }
    }

    /// Exclusive hold for a replication state transition itself
    /// (step-up/step-down paths and tests simulating them).
    pub async fn state_transition_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.state_transition.clone().write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_excludes_intent() {
        let locks = LockManager::new();
        let coll = Uuid::new_v4();
        let exclusive = locks
            .collection_exclusive(coll, Duration::from_millis(50))
            .await
            .unwrap();
        let err = locks
            .collection_intent(coll, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, IndexBuildError::LockTimeout("collection"));
        drop(exclusive);
        locks
            .collection_intent(coll, Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_intent_locks_coexist() {
        let locks = LockManager::new();
        let coll = Uuid::new_v4();
        let _a = locks
            .collection_intent(coll, Duration::from_millis(20))
            .await
            .unwrap();
        let _b = locks
            .collection_intent(coll, Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_transition_blocks_shared_pass() {
        let locks = LockManager::new();
        let step_down = locks.state_transition_exclusive().await;
        let err = locks
            .state_transition_shared(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IndexBuildError::LockTimeout("replication state transition")
        );
        drop(step_down);
        locks
            .state_transition_shared(Duration::from_millis(20))
            .await
            .unwrap();
    }
}
