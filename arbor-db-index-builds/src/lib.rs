//! # Arbor DB Index Builds
//!
//! Background index-build coordination for Arbor DB. This crate provides:
//!
//! - The build registry and per-build lifecycle state machine
//! - The coordinator driving each build's multi-phase pipeline on its own task
//! - The replicated two-phase commit/abort protocol (start/commit/abort
//!   entries, commit-quorum voting)
//! - Crash/resume persistence for resumable builds
//! - Abort triggers: administrative, disk-space, initial-sync, rollback,
//!   tenant migration, shutdown
//!
//! ## Design
//!
//! The registry owns the canonical build record; every other party — the
//! pipeline task, abort callers, the oplog applier — holds a reference-counted
//! handle and goes through the lifecycle state machine, which guarantees
//! exactly one terminal transition per build. Locking follows a strict
//! discipline: phases enqueue behind the replication state transition lock
//! with a bounded wait before taking the collection exclusively, releasing
//! everything and retrying on timeout.

pub mod build;
pub mod config;
pub mod coordinator;
pub mod disk;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod locks;
pub mod mechanics;
pub mod memory;
pub mod persist;
pub mod registry;
pub mod retry;

// Re-export main types
pub use build::{
    BuildPhase, BuildProtocol, BuildRecord, CatalogStats, CommitQuorum, IndexSpec, ScanPosition,
};
pub use config::CoordinatorConfig;
pub use coordinator::{
    ApplicationMode, IndexBuildsCoordinator, InterruptedBuild, InterruptedBuilds,
    StartBuildRequest,
};
pub use disk::{spawn_disk_space_monitor, DiskSpaceProbe, FixedDiskSpace};
pub use error::{IndexBuildError, Result};
pub use hooks::{BuildCheckpoint, BuildHooks, NoopHooks};
pub use lifecycle::{ActiveBuild, BuildAction, BuildCompletion, BuildOutcome, BuildState, TryAbort};
pub use locks::{CollectionLock, LockManager, StateTransitionGuard};
pub use mechanics::{DrainReadSource, DrainYieldPolicy, IndexBuildMechanics};
pub use memory::MemoryCatalog;
pub use persist::{BuildEntry, BuildPersistence, MemoryBuildPersistence, ResumeCheckpoint};
pub use registry::{BuildHandle, BuildRegistry};
pub use retry::{with_retries, RetryPolicy};
