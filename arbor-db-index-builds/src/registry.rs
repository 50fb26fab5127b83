//! Registry of all index builds known to this node
//!
//! A single mutex-guarded map keyed by build UUID. Cross-cutting queries
//! (by collection, by database, by tenant) are derived views computed by
//! filtering a snapshot rather than maintained as secondary indices, trading
//! a small scan for the absence of multi-index consistency bugs.

use crate::build::BuildProtocol;
use crate::error::{IndexBuildError, Result};
use crate::lifecycle::ActiveBuild;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Shared handle to a registered build
pub type BuildHandle = Arc<ActiveBuild>;

/// The mutex-guarded build table.
///
/// All mutation is serialized by the inner mutex; enumeration copies handles
/// out under the lock and runs predicates outside it, so a predicate that
/// re-enters the registry cannot deadlock.
#[derive(Default)]
pub struct BuildRegistry {
    builds: Mutex<FxHashMap<Uuid, BuildHandle>>,
    /// Signaled on every unregister; `await_none` waiters re-check on it
    unregistered: Notify,
}

impl std::fmt::Debug for BuildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRegistry")
            .field("active", &self.builds.lock().len())
            .finish()
    }
}

impl BuildRegistry {
    /// New empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a build. Fails without mutating anything if the UUID is
    /// already registered.
    pub fn register(&self, build: BuildHandle) -> Result<()> {
        let mut builds = self.builds.lock();
        let build_id = build.record.build_id;
        if builds.contains_key(&build_id) {
            return Err(IndexBuildError::AlreadyRegistered(build_id));
        }
        builds.insert(build_id, build);
        Ok(())
    }

    /// Remove a build. Called at most once per build, only after its
    /// completion signal has been fulfilled.
    pub fn unregister(&self, build_id: Uuid) -> Option<BuildHandle> {
        let removed = self.builds.lock().remove(&build_id);
        if removed.is_some() {
            debug!(build_id = %build_id, "Index build: unregistered");
            self.unregistered.notify_waiters();
        }
        removed
    }

    /// Look up one build
    pub fn get(&self, build_id: Uuid) -> Option<BuildHandle> {
        self.builds.lock().get(&build_id).cloned()
    }

    /// Snapshot of builds matching `predicate`.
    ///
    /// The snapshot is consistent at the instant it is taken; returned
    /// handles stay valid even if concurrently unregistered.
    pub fn filter<P>(&self, predicate: P) -> Vec<BuildHandle>
    where
        P: Fn(&ActiveBuild) -> bool,
    {
        let snapshot: Vec<BuildHandle> = self.builds.lock().values().cloned().collect();
        snapshot.into_iter().filter(|b| predicate(b)).collect()
    }

    /// All registered builds
    pub fn all(&self) -> Vec<BuildHandle> {
        self.builds.lock().values().cloned().collect()
    }

    /// Number of registered builds
    pub fn len(&self) -> usize {
        self.builds.lock().len()
    }

    /// Whether no build is registered
    pub fn is_empty(&self) -> bool {
        self.builds.lock().is_empty()
    }

    /// Builds targeting `collection_id`
    pub fn for_collection(&self, collection_id: Uuid) -> Vec<BuildHandle> {
        self.filter(|b| b.record.collection_id == collection_id)
    }

    /// Builds targeting `db_name`
    pub fn for_db(&self, db_name: &str) -> Vec<BuildHandle> {
        self.filter(|b| b.record.db_name == db_name)
    }

    /// Builds using the given protocol
    pub fn with_protocol(&self, protocol: BuildProtocol) -> Vec<BuildHandle> {
        self.filter(|b| b.record.protocol == protocol)
    }

    /// Block (cooperatively) until no registered build matches `predicate`,
    /// or until `deadline` elapses.
    ///
    /// Returns immediately when nothing matches. The notified future is
    /// created before each check so an unregister landing between check and
    /// wait is never missed.
    pub async fn await_none<P>(&self, predicate: P, deadline: Duration) -> Result<()>
    where
        P: Fn(&ActiveBuild) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.unregistered.notified();
                if self.filter(&predicate).is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.map_err(|_| {
            IndexBuildError::WaitTimeout(format!(
                "builds still matching after {}ms",
                deadline.as_millis()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildRecord, CommitQuorum, IndexSpec};
    use serde_json::json;

    fn handle(db: &str, collection_id: Uuid, protocol: BuildProtocol) -> BuildHandle {
        let record = BuildRecord::new(
            Uuid::new_v4(),
            collection_id,
            db,
            vec![IndexSpec(json!({"name": "a_1", "key": {"a": 1}}))],
            protocol,
            CommitQuorum::default(),
        )
        .unwrap();
        ActiveBuild::new(record)
    }

    #[test]
    fn test_register_at_most_once() {
        let registry = BuildRegistry::new();
        let build = handle("app", Uuid::new_v4(), BuildProtocol::TwoPhase);
        let build_id = build.record.build_id;
        registry.register(build.clone()).unwrap();
        let err = registry.register(build).unwrap_err();
        assert_eq!(err, IndexBuildError::AlreadyRegistered(build_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_filtered_views() {
        let registry = BuildRegistry::new();
        let coll = Uuid::new_v4();
        registry
            .register(handle("app", coll, BuildProtocol::TwoPhase))
            .unwrap();
        registry
            .register(handle("app", Uuid::new_v4(), BuildProtocol::SinglePhase))
            .unwrap();
        registry
            .register(handle("other", Uuid::new_v4(), BuildProtocol::TwoPhase))
            .unwrap();

        assert_eq!(registry.for_collection(coll).len(), 1);
        assert_eq!(registry.for_db("app").len(), 2);
        assert_eq!(registry.with_protocol(BuildProtocol::TwoPhase).len(), 2);
    }

    #[test]
    fn test_handles_stable_across_unregister() {
        let registry = BuildRegistry::new();
        let build = handle("app", Uuid::new_v4(), BuildProtocol::TwoPhase);
        registry.register(build.clone()).unwrap();
        let snapshot = registry.all();
        registry.unregister(build.record.build_id);
        // The snapshot handle is still usable after unregistration.
        assert_eq!(snapshot[0].record.build_id, build.record.build_id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_await_none_immediate_when_empty() {
        let registry = BuildRegistry::new();
        registry
            .await_none(|_| true, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_await_none_wakes_on_unregister() {
        let registry = Arc::new(BuildRegistry::new());
        let build = handle("app", Uuid::new_v4(), BuildProtocol::TwoPhase);
        let build_id = build.record.build_id;
        registry.register(build).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .await_none(|_| true, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        registry.unregister(build_id);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_await_none_times_out() {
        let registry = BuildRegistry::new();
        registry
            .register(handle("app", Uuid::new_v4(), BuildProtocol::TwoPhase))
            .unwrap();
        let err = registry
            .await_none(|_| true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexBuildError::WaitTimeout(_)));
    }
}
