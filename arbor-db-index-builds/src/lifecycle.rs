//! Per-build lifecycle state machine and completion signaling
//!
//! Up to three independent triggers (a local error, a primary-issued signal,
//! an administrative command) can race to finish the same build. All of them
//! funnel through the arbitration methods here; exactly one wins and drives
//! teardown, the rest observe `AlreadyAborted`/terminal state and wait on the
//! completion signal. The completion signal is a one-shot, multi-reader cell:
//! every waiter observes the same terminal outcome.

use crate::build::{BuildPhase, BuildRecord, CatalogStats};
use crate::error::IndexBuildError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Lifecycle states. Terminal states are entered at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Catalog setup is running on the starting thread
    Setup,
    /// The pipeline task owns the build
    InProgress,
    /// The pipeline is tearing the build down after a local failure
    SelfAborting,
    /// An external caller won arbitration and is tearing the build down
    ExternallyAborting,
    /// A commit signal was accepted; the pipeline is committing
    Committing,
    /// Terminal: the index is ready
    Committed,
    /// Terminal: the build was torn down
    Aborted,
}

impl BuildState {
    /// Whether this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Committed | BuildState::Aborted)
    }

    /// Whether an abort is in flight or done
    pub fn is_aborting(&self) -> bool {
        matches!(
            self,
            BuildState::SelfAborting | BuildState::ExternallyAborting | BuildState::Aborted
        )
    }
}

/// What drove a build to its terminal transition.
///
/// The signal kind decides how cleanup is performed: a rollback abort defers
/// physical cleanup to recovery, an oplog abort must not replicate anything,
/// a primary abort replicates the abort entry itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildAction {
    /// Commit quorum satisfied on the primary
    CommitQuorumSatisfied,
    /// commitIndexBuild oplog entry applied on a secondary
    OplogCommit,
    /// Single-phase build finished its pipeline
    SinglePhaseCommit,
    /// Abort decided on this node while primary (or administratively)
    PrimaryAbort,
    /// abortIndexBuild oplog entry applied on a secondary
    OplogAbort,
    /// Abort while the node is initial-syncing
    InitialSyncAbort,
    /// Abort ahead of rollback; physical cleanup is deferred
    RollbackAbort,
    /// Abort because the tenant is migrating away
    TenantMigrationAbort,
}

impl BuildAction {
    /// Whether this signal commits the build
    pub fn is_commit(&self) -> bool {
        matches!(
            self,
            BuildAction::CommitQuorumSatisfied
                | BuildAction::OplogCommit
                | BuildAction::SinglePhaseCommit
        )
    }
}

/// The terminal outcome every completion waiter observes
pub type BuildOutcome = std::result::Result<CatalogStats, IndexBuildError>;

/// Handle to wait for a build's terminal outcome.
///
/// Cheap to clone; any number of waiters resolve with the same value.
#[derive(Debug, Clone)]
pub struct BuildCompletion {
    rx: watch::Receiver<Option<BuildOutcome>>,
}

impl BuildCompletion {
    /// Wait for the terminal outcome
    pub async fn wait(mut self) -> BuildOutcome {
        match self.rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.clone().expect("completion cell is fulfilled"),
            // Sender dropped without fulfilling: process shutdown path.
            Err(_) => Err(IndexBuildError::Shutdown),
        }
    }

    /// Non-blocking check; `None` while the build is still running
    pub fn try_get(&self) -> Option<BuildOutcome> {
        self.rx.borrow().clone()
    }

    /// A completion that is already resolved (no-op builds: every requested
    /// index existed before the build started)
    pub fn ready(outcome: BuildOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        BuildCompletion { rx }
    }
}

/// Mutable lifecycle state, single-writer-with-lock
#[derive(Debug)]
struct Lifecycle {
    state: BuildState,
    /// Signal that drove (or is driving) the terminal transition
    action: Option<BuildAction>,
    /// Set exactly when entering an aborting state; immutable thereafter
    abort_reason: Option<String>,
    /// Once setup has made the catalog entry visible, failure requires
    /// explicit cleanup instead of discarding the record
    cleanup_required: bool,
    /// Secondary hit a local error and asked the primary to abort; the build
    /// cannot decide its own fate until an oplog entry arrives
    awaiting_remote_decision: bool,
    /// Members that have signaled commit readiness (primary side)
    ready_members: HashSet<String>,
    /// Whether the build still qualifies for resume checkpointing
    resumable: bool,
    /// Most recently completed resumability checkpoint
    phase: BuildPhase,
}

/// One registered build: immutable identity plus lock-guarded lifecycle.
///
/// The registry owns the canonical entry; every other party (pipeline task,
/// abort callers, the oplog applier) holds an `Arc` handle and goes through
/// these methods to mutate lifecycle state.
pub struct ActiveBuild {
    /// Immutable identity
    pub record: BuildRecord,
    lifecycle: Mutex<Lifecycle>,
    /// Wakes the pipeline's signal wait when the lifecycle changes
    signal: Notify,
    completion_tx: watch::Sender<Option<BuildOutcome>>,
    completion_rx: watch::Receiver<Option<BuildOutcome>>,
}

impl std::fmt::Debug for ActiveBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveBuild")
            .field("build_id", &self.record.build_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ActiveBuild {
    /// New build in `Setup` state
    pub fn new(record: BuildRecord) -> Arc<Self> {
        let (completion_tx, completion_rx) = watch::channel(None);
        Arc::new(Self {
            record,
            lifecycle: Mutex::new(Lifecycle {
                state: BuildState::Setup,
                action: None,
                abort_reason: None,
                cleanup_required: false,
                awaiting_remote_decision: false,
                ready_members: HashSet::new(),
                resumable: false,
                phase: BuildPhase::Initialized,
            }),
            signal: Notify::new(),
            completion_tx,
            completion_rx,
        })
    }

    /// Subscribe to the terminal outcome
    pub fn completion(&self) -> BuildCompletion {
        BuildCompletion {
            rx: self.completion_rx.clone(),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> BuildState {
        self.lifecycle.lock().state
    }

    /// The signal that drove the terminal transition, once one is set
    pub fn action(&self) -> Option<BuildAction> {
        self.lifecycle.lock().action
    }

    /// The abort reason, once one is set
    pub fn abort_reason(&self) -> Option<String> {
        self.lifecycle.lock().abort_reason.clone()
    }

    /// Whether failure now requires explicit catalog cleanup
    pub fn cleanup_required(&self) -> bool {
        self.lifecycle.lock().cleanup_required
    }

    /// Whether the build still qualifies for resume checkpointing
    pub fn is_resumable(&self) -> bool {
        self.lifecycle.lock().resumable
    }

    /// Mark the build resumable (set once majority-wait succeeds)
    pub fn set_resumable(&self, resumable: bool) {
        self.lifecycle.lock().resumable = resumable;
    }

    /// Most recently completed resumability checkpoint
    pub fn phase(&self) -> BuildPhase {
        self.lifecycle.lock().phase
    }

    /// Record that the build passed a resumability checkpoint
    pub fn set_phase(&self, phase: BuildPhase) {
        self.lifecycle.lock().phase = phase;
    }

    /// The catalog entry is now visible; failure past this point must clean
    /// up explicitly.
    pub fn complete_setup(&self) {
        self.lifecycle.lock().cleanup_required = true;
    }

    /// Hand the build to its pipeline task.
    ///
    /// Fails if an abort arrived while setup was still running; the caller
    /// routes that into the abort path instead of starting phases.
    pub fn set_in_progress(&self) -> std::result::Result<(), IndexBuildError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_aborting() {
            return Err(IndexBuildError::BuildAborted {
                reason: lifecycle
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "aborted during setup".to_string()),
            });
        }
        lifecycle.state = BuildState::InProgress;
        Ok(())
    }

    /// Arbitrate an external abort request.
    ///
    /// Exactly one concurrent caller observes `ContinueAbort` and owns
    /// teardown; the others see `AlreadyAborted` (or `NotAborted` if the
    /// build committed first) and wait on the completion signal.
    pub fn try_abort(&self, action: BuildAction, reason: &str) -> TryAbort {
        debug_assert!(!action.is_commit());
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            BuildState::Committed => TryAbort::NotAborted,
            // A secondary that failed locally parked itself waiting for the
            // primary's decision; the replicated abort takes over teardown.
            BuildState::SelfAborting if lifecycle.awaiting_remote_decision => {
                lifecycle.state = BuildState::ExternallyAborting;
                lifecycle.action = Some(action);
                drop(lifecycle);
                self.signal.notify_waiters();
                TryAbort::ContinueAbort
            }
            BuildState::Aborted
            | BuildState::SelfAborting
            | BuildState::ExternallyAborting => TryAbort::AlreadyAborted,
            // Setup still running on the starting thread, or a commit signal
            // already accepted: neither is long-lived, poll again.
            BuildState::Setup | BuildState::Committing => TryAbort::Retry,
            BuildState::InProgress => {
                lifecycle.state = BuildState::ExternallyAborting;
                lifecycle.action = Some(action);
                lifecycle.abort_reason = Some(reason.to_string());
                drop(lifecycle);
                self.signal.notify_waiters();
                TryAbort::ContinueAbort
            }
        }
    }

    /// Accept a commit signal.
    ///
    /// Returns `true` when the signal was accepted (or the build is already
    /// past arbitration) and the caller should wait on the completion signal;
    /// `false` when the build cannot yet commit and the caller must retry.
    pub fn try_commit(&self, action: BuildAction) -> bool {
        debug_assert!(action.is_commit());
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            BuildState::Setup => false,
            BuildState::InProgress => {
                lifecycle.state = BuildState::Committing;
                lifecycle.action = Some(action);
                drop(lifecycle);
                self.signal.notify_waiters();
                true
            }
            BuildState::SelfAborting
                if lifecycle.awaiting_remote_decision && action == BuildAction::OplogCommit =>
            {
                // The primary committed a build this secondary failed
                // locally. The replica cannot diverge and cannot recover.
                crate::error::protocol_violation(
                    "try_commit",
                    &format!(
                        "commitIndexBuild for build {} which failed locally: {:?}",
                        self.record.build_id, lifecycle.abort_reason
                    ),
                );
            }
            // Already driving toward a terminal state; the caller's wait on
            // the completion signal reports what actually happened.
            BuildState::Committing
            | BuildState::SelfAborting
            | BuildState::ExternallyAborting
            | BuildState::Committed
            | BuildState::Aborted => true,
        }
    }

    /// Force the build to abort itself (disk space, unexpected pipeline
    /// error). Returns `false` if the build already reached — or is already
    /// being driven to — a terminal state.
    pub fn force_self_abort(&self, reason: &str) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            BuildState::Setup | BuildState::InProgress => {
                lifecycle.state = BuildState::SelfAborting;
                lifecycle.action = Some(BuildAction::PrimaryAbort);
                lifecycle.abort_reason = Some(reason.to_string());
                drop(lifecycle);
                self.signal.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// The pipeline's own commit attempt failed (constraint violation,
    /// exhausted retries): route the build back into self-abort. Only valid
    /// from `Committing`, and only the pipeline calls it — external callers
    /// observing `Committing` must keep retrying instead.
    pub fn commit_failed(&self, reason: &str) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != BuildState::Committing {
            return false;
        }
        lifecycle.state = BuildState::SelfAborting;
        lifecycle.action = Some(BuildAction::PrimaryAbort);
        if lifecycle.abort_reason.is_none() {
            lifecycle.abort_reason = Some(reason.to_string());
        }
        drop(lifecycle);
        self.signal.notify_waiters();
        true
    }

    /// Record that this secondary asked the primary to abort; the build now
    /// waits for a replicated decision and cannot decide its own fate.
    pub fn begin_remote_decision_wait(&self, reason: &str) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.awaiting_remote_decision = true;
        if !lifecycle.state.is_aborting() {
            lifecycle.state = BuildState::SelfAborting;
        }
        if lifecycle.abort_reason.is_none() {
            lifecycle.abort_reason = Some(reason.to_string());
        }
    }

    /// Record a commit-readiness vote (primary side); returns the number of
    /// distinct ready members.
    pub fn add_ready_member(&self, member: &str) -> usize {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.ready_members.insert(member.to_string());
        lifecycle.ready_members.len()
    }

    /// Error out of the current phase if an abort signal has landed.
    ///
    /// This is the cancellation check-point: `force_self_abort` and external
    /// aborts never interrupt a mechanics call in progress, they set state
    /// observed here.
    pub fn check_for_interrupt(&self) -> std::result::Result<(), IndexBuildError> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_aborting() {
            return Err(IndexBuildError::BuildAborted {
                reason: lifecycle
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "aborted".to_string()),
            });
        }
        Ok(())
    }

    /// Wait until the lifecycle is signaled or `timeout` elapses.
    ///
    /// Callers re-check state in a loop around this; the timeout bounds how
    /// long a wakeup lost between their check and this wait can be delayed.
    pub async fn wait_for_signal(&self, timeout: Duration) {
        let notified = self.signal.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Funnel point for the terminal transition.
    ///
    /// Fulfills the completion signal exactly once; returns `false` if
    /// another caller already finished the build.
    pub fn finish(&self, outcome: BuildOutcome) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = if outcome.is_ok() {
            BuildState::Committed
        } else {
            BuildState::Aborted
        };
        // Send while still holding the lifecycle lock so state and outcome
        // move together; watch::send never blocks.
        self.completion_tx.send_replace(Some(outcome));
        drop(lifecycle);
        self.signal.notify_waiters();
        debug!(build_id = %self.record.build_id, "Index build: reached terminal state");
        true
    }
}

/// Result of [`ActiveBuild::try_abort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAbort {
    /// The build committed; it cannot be aborted
    NotAborted,
    /// Another trigger already aborted (or is aborting) the build
    AlreadyAborted,
    /// Transient condition; back off and re-invoke
    Retry,
    /// The caller won arbitration and must perform teardown, then finalize
    ContinueAbort,
}
