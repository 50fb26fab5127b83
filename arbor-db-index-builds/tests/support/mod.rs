//! Shared harness for index build integration tests
#![allow(dead_code)]

use arbor_db_index_builds::{
    BuildPhase, BuildState, CoordinatorConfig, IndexBuildsCoordinator, IndexSpec,
    MemoryBuildPersistence, MemoryCatalog,
};
use arbor_db_replication::MemoryReplication;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Generous deadline for await-none style waits in tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Opt-in log output while debugging a test run (`RUST_LOG=debug`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct Harness {
    pub catalog: MemoryCatalog,
    pub repl: MemoryReplication,
    pub persistence: MemoryBuildPersistence,
    pub coordinator: Arc<IndexBuildsCoordinator>,
}

/// Coordinator over in-memory collaborators with fast test intervals
pub fn harness() -> Harness {
    harness_with_config(CoordinatorConfig::fast())
}

pub fn harness_with_config(config: CoordinatorConfig) -> Harness {
    let catalog = MemoryCatalog::new();
    let repl = MemoryReplication::new();
    let persistence = MemoryBuildPersistence::new();
    let coordinator = IndexBuildsCoordinator::new(
        Arc::new(catalog.clone()),
        Arc::new(repl.clone()),
        Arc::new(persistence.clone()),
        config,
    );
    Harness {
        catalog,
        repl,
        persistence,
        coordinator,
    }
}

/// Second node sharing this harness's catalog and persistence (restart
/// simulation: fresh registry and locks, same durable state)
pub fn restarted(harness: &Harness) -> Harness {
    let coordinator = IndexBuildsCoordinator::new(
        Arc::new(harness.catalog.clone()),
        Arc::new(harness.repl.clone()),
        Arc::new(harness.persistence.clone()),
        CoordinatorConfig::fast(),
    );
    Harness {
        catalog: harness.catalog.clone(),
        repl: harness.repl.clone(),
        persistence: harness.persistence.clone(),
        coordinator,
    }
}

pub fn spec(name: &str, key: serde_json::Value) -> IndexSpec {
    IndexSpec(json!({"name": name, "key": key}))
}

/// Wait until the build has drained side writes and is sitting in its
/// commit/abort wait (or has already finished).
pub async fn wait_until_parked(h: &Harness, build_id: Uuid) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match h.coordinator.registry().get(build_id) {
            Some(handle)
                if handle.phase() == BuildPhase::Drain
                    && handle.state() == BuildState::InProgress =>
            {
                return;
            }
            Some(_) => {}
            None => return,
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "build {build_id} never reached its commit wait"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
