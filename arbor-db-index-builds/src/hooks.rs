//! Named pipeline checkpoints for tests
//!
//! The pipeline calls the injected hook at each named point. Production uses
//! [`NoopHooks`]; tests install an implementation that records ordering or
//! triggers concurrent operations at a precise moment.

use uuid::Uuid;

/// Named points the pipeline passes through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildCheckpoint {
    /// Catalog setup finished; the unfinished index is visible
    SetupComplete,
    /// About to start (or resume) the collection scan
    BeforeScan,
    /// Collection scan finished
    AfterScan,
    /// Non-blocking side-write drain finished
    AfterSideWritesDrain,
    /// Commit readiness signaled (vote cast or local check passed)
    AfterCommitReadiness,
    /// Commit signal accepted; about to run the final locked commit
    BeforeCommit,
    /// About to tear down after an abort decision
    BeforeAbortCleanup,
}

/// Pipeline observation hook
pub trait BuildHooks: Send + Sync {
    /// Called when `build_id` reaches `checkpoint`
    fn reached(&self, checkpoint: BuildCheckpoint, build_id: Uuid);
}

/// Production hook: does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BuildHooks for NoopHooks {
    fn reached(&self, _checkpoint: BuildCheckpoint, _build_id: Uuid) {}
}
