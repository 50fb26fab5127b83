//! Index builds coordinator
//!
//! The orchestrator for every index build on this node. It registers builds,
//! runs each pipeline on its own task, arbitrates commit-quorum and abort
//! signals arriving from replication, and exposes the administrative surface
//! (abort by build/collection/database/tenant, disk-space sweep, rollback
//! stop, recovery restart/resume).
//!
//! # Pipeline
//!
//! ```text
//! Setup -> Scanning -> Draining(non-blocking) -> AwaitingCommitReadiness
//!       -> Draining(blocking) -> CommitOrAbort -> Terminal
//! ```
//!
//! Every transition that needs an exclusive collection lock first enqueues
//! behind the replication state transition lock with a bounded wait; on
//! timeout all locks are released and the phase retries from scratch.

use crate::build::{
    BuildPhase, BuildProtocol, BuildRecord, CatalogStats, CommitQuorum, IndexSpec,
};
use crate::config::CoordinatorConfig;
use crate::error::{protocol_violation, IndexBuildError, Result};
use crate::hooks::{BuildCheckpoint, BuildHooks, NoopHooks};
use crate::lifecycle::{ActiveBuild, BuildAction, BuildCompletion, BuildState, TryAbort};
use crate::locks::{CollectionLock, LockManager, StateTransitionGuard};
use crate::mechanics::{DrainReadSource, DrainYieldPolicy, IndexBuildMechanics};
use crate::persist::{BuildEntry, BuildPersistence, ResumeCheckpoint};
use crate::registry::{BuildHandle, BuildRegistry};
use crate::retry::{with_retries, RetryPolicy};
use arbor_db_replication::{IndexBuildOplogEntry, OpTime, ReplicationCoordinator};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a build start reached this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationMode {
    /// Started locally by a client; the primary replicates the start entry
    Normal,
    /// Started by applying a replicated start entry on a secondary
    OplogApply,
    /// Restarted or resumed during recovery; nothing is replicated
    Recovery,
}

/// Request to start an index build
#[derive(Debug, Clone)]
pub struct StartBuildRequest {
    /// Database holding the target collection
    pub db_name: String,
    /// Target collection
    pub collection_id: Uuid,
    /// Indexes to build
    pub index_specs: Vec<IndexSpec>,
    /// Commit/abort coordination protocol
    pub protocol: BuildProtocol,
    /// Commit quorum (two-phase only)
    pub commit_quorum: CommitQuorum,
    /// Build UUID; assigned when absent
    pub build_id: Option<Uuid>,
    /// How the start reached this node
    pub mode: ApplicationMode,
    /// Tolerate options conflicts with existing indexes (secondary catch-up,
    /// recovery)
    pub relaxed_constraints: bool,
    /// Resume from a persisted checkpoint instead of scanning from the start
    pub resume: Option<ResumeCheckpoint>,
}

impl StartBuildRequest {
    /// Request with defaults: fresh UUID, voting-members quorum, normal mode
    pub fn new(
        db_name: impl Into<String>,
        collection_id: Uuid,
        index_specs: Vec<IndexSpec>,
        protocol: BuildProtocol,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            collection_id,
            index_specs,
            protocol,
            commit_quorum: CommitQuorum::default(),
            build_id: None,
            mode: ApplicationMode::Normal,
            relaxed_constraints: false,
            resume: None,
        }
    }

    /// Builder method to pin the build UUID
    pub fn with_build_id(mut self, build_id: Uuid) -> Self {
        self.build_id = Some(build_id);
        self
    }

    /// Builder method to set the commit quorum
    pub fn with_commit_quorum(mut self, quorum: CommitQuorum) -> Self {
        self.commit_quorum = quorum;
        self
    }
}

/// A two-phase build interrupted for rollback, with enough detail to restart
#[derive(Debug, Clone)]
pub struct InterruptedBuild {
    /// Target collection
    pub collection_id: Uuid,
    /// Database holding the target collection
    pub db_name: String,
    /// Specs the build was creating
    pub index_specs: Vec<IndexSpec>,
}

/// Interrupted builds keyed by build UUID
pub type InterruptedBuilds = FxHashMap<Uuid, InterruptedBuild>;

#[derive(Debug, Clone, Copy)]
struct BuildOptions {
    mode: ApplicationMode,
    relaxed_constraints: bool,
}

/// The index builds coordinator
pub struct IndexBuildsCoordinator {
    registry: BuildRegistry,
    mechanics: Arc<dyn IndexBuildMechanics>,
    repl: Arc<dyn ReplicationCoordinator>,
    persistence: Arc<dyn BuildPersistence>,
    locks: Arc<LockManager>,
    hooks: Arc<dyn BuildHooks>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for IndexBuildsCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuildsCoordinator")
            .field("active", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl IndexBuildsCoordinator {
    /// New coordinator over the given collaborators
    pub fn new(
        mechanics: Arc<dyn IndexBuildMechanics>,
        repl: Arc<dyn ReplicationCoordinator>,
        persistence: Arc<dyn BuildPersistence>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: BuildRegistry::new(),
            mechanics,
            repl,
            persistence,
            locks: Arc::new(LockManager::new()),
            hooks: Arc::new(NoopHooks),
            config,
        })
    }

    /// New coordinator with an observation hook installed (tests)
    pub fn with_hooks(
        mechanics: Arc<dyn IndexBuildMechanics>,
        repl: Arc<dyn ReplicationCoordinator>,
        persistence: Arc<dyn BuildPersistence>,
        config: CoordinatorConfig,
        hooks: Arc<dyn BuildHooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: BuildRegistry::new(),
            mechanics,
            repl,
            persistence,
            locks: Arc::new(LockManager::new()),
            hooks,
            config,
        })
    }

    /// The build registry (filtered enumeration, await-none)
    pub fn registry(&self) -> &BuildRegistry {
        &self.registry
    }

    /// The lock manager (step-up/step-down paths take the state transition
    /// lock exclusively through this)
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn lock_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_lock_retries,
            initial_backoff: self.config.commit_retry_interval,
            max_backoff: self.config.abort_retry_interval,
        }
    }

    /// Enqueue behind any replication state transition (two-phase only),
    /// then take the collection exclusively. Guards drop together on error,
    /// so a timeout releases everything for the caller's retry.
    async fn acquire_exclusive(
        &self,
        collection_id: Uuid,
        two_phase: bool,
    ) -> Result<(Option<StateTransitionGuard>, CollectionLock)> {
        let rstl = if two_phase {
            Some(
                self.locks
                    .state_transition_shared(self.config.state_transition_lock_timeout)
                    .await?,
            )
        } else {
            None
        };
        let coll = self
            .locks
            .collection_exclusive(collection_id, self.config.collection_lock_timeout)
            .await?;
        Ok((rstl, coll))
    }

    async fn collection_intent_with_retries(&self, collection_id: Uuid) -> Result<CollectionLock> {
        with_retries(&self.lock_policy(), "collection intent lock", || {
            self.locks
                .collection_intent(collection_id, self.config.collection_lock_timeout)
        })
        .await
    }

    // =========================================================================
    // Starting builds
    // =========================================================================

    /// Register and launch an index build.
    ///
    /// Performs setup (catalog write, build entry, start oplog entry for
    /// two-phase primaries) on the calling task, then spawns the pipeline and
    /// returns a completion handle. If every requested index already exists
    /// the build completes immediately as a no-op.
    pub async fn start_index_build(
        self: &Arc<Self>,
        request: StartBuildRequest,
    ) -> Result<BuildCompletion> {
        let StartBuildRequest {
            db_name,
            collection_id,
            index_specs,
            protocol,
            commit_quorum,
            build_id,
            mode,
            relaxed_constraints,
            resume,
        } = request;

        if !self.mechanics.collection_exists(collection_id).await {
            return Err(IndexBuildError::CollectionNotFound(collection_id));
        }
        let to_build = self
            .mechanics
            .prune_existing(collection_id, &index_specs, relaxed_constraints)
            .await?;
        if to_build.is_empty() {
            let count = self.mechanics.num_ready_indexes(collection_id).await?;
            info!(
                collection_id = %collection_id,
                "Index build: all requested indexes already exist"
            );
            return Ok(BuildCompletion::ready(Ok(CatalogStats {
                indexes_before: count,
                indexes_after: count,
            })));
        }

        let build_id = build_id.unwrap_or_else(Uuid::new_v4);
        let record = BuildRecord::new(
            build_id,
            collection_id,
            db_name,
            to_build,
            protocol,
            commit_quorum,
        )?;
        let handle = ActiveBuild::new(record);
        self.registry.register(handle.clone())?;
        info!(
            build_id = %build_id,
            collection_id = %collection_id,
            protocol = ?protocol,
            "Registered index build"
        );

        let options = BuildOptions {
            mode,
            relaxed_constraints,
        };
        let setup_optime = match self.set_up_build(&handle, mode).await {
            Ok(optime) => optime,
            Err(err) => {
                self.clean_up_failed_setup(&handle, &err).await;
                return Err(err);
            }
        };
        self.hooks.reached(BuildCheckpoint::SetupComplete, build_id);

        let completion = handle.completion();
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .run_build(handle, options, resume, setup_optime)
                .await;
        });
        Ok(completion)
    }

    /// Setup under locks, with bounded retries on lock timeouts only: a
    /// client create on a secondary must fail fast with `NotPrimary`, not
    /// spin.
    async fn set_up_build(
        &self,
        handle: &BuildHandle,
        mode: ApplicationMode,
    ) -> Result<Option<OpTime>> {
        let policy = self.lock_policy();
        let mut attempt = 0u32;
        loop {
            match self.try_set_up_build(handle, mode).await {
                Err(IndexBuildError::LockTimeout(which)) if attempt + 1 < policy.max_attempts => {
                    debug!(
                        build_id = %handle.record.build_id,
                        lock = which,
                        attempt,
                        "Index build setup: lock wait expired, retrying"
                    );
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_set_up_build(
        &self,
        handle: &BuildHandle,
        mode: ApplicationMode,
    ) -> Result<Option<OpTime>> {
        let record = &handle.record;
        let _guards = self
            .acquire_exclusive(record.collection_id, record.is_two_phase())
            .await?;
        handle.check_for_interrupt()?;

        let replicate_start = record.is_two_phase() && mode == ApplicationMode::Normal;
        if replicate_start && !self.repl.is_primary_for(&record.db_name) {
            return Err(IndexBuildError::NotPrimary(format!(
                "cannot start index build {} while not primary",
                record.build_id
            )));
        }

        self.mechanics
            .set_up(record.collection_id, record.build_id, &record.index_specs)
            .await?;
        // The unfinished index is in the catalog now; failure past this
        // point must clean up instead of discarding the record.
        handle.complete_setup();

        if record.is_two_phase() {
            self.persistence
                .put_entry(BuildEntry {
                    build_id: record.build_id,
                    collection_id: record.collection_id,
                    commit_quorum: record.commit_quorum,
                    index_names: record.index_names.clone(),
                })
                .await?;
        }
        if replicate_start {
            let optime = self
                .repl
                .replicate(IndexBuildOplogEntry::StartIndexBuild {
                    collection_id: record.collection_id,
                    build_id: record.build_id,
                    index_specs: record.raw_specs(),
                })
                .await?;
            return Ok(Some(optime));
        }
        Ok(None)
    }

    async fn clean_up_failed_setup(&self, handle: &BuildHandle, err: &IndexBuildError) {
        let record = &handle.record;
        warn!(
            build_id = %record.build_id,
            error = %err,
            "Index build: setup failed"
        );
        if handle.cleanup_required() {
            let cleanup = async {
                let _guards = self
                    .acquire_exclusive(record.collection_id, record.is_two_phase())
                    .await?;
                self.mechanics
                    .abort(record.collection_id, record.build_id)
                    .await?;
                self.persistence.remove_entry(record.build_id).await
            };
            if let Err(cleanup_err) = cleanup.await {
                warn!(
                    build_id = %record.build_id,
                    error = %cleanup_err,
                    "Index build: failed to clean up after setup failure"
                );
            }
        }
        handle.finish(Err(err.clone()));
        self.registry.unregister(record.build_id);
    }

    // =========================================================================
    // The pipeline
    // =========================================================================

    async fn run_build(
        self: Arc<Self>,
        handle: BuildHandle,
        options: BuildOptions,
        resume: Option<ResumeCheckpoint>,
        setup_optime: Option<OpTime>,
    ) {
        if let Err(err) = handle.set_in_progress() {
            self.handle_build_failure(&handle, options, err).await;
            return;
        }
        match self
            .run_phases(&handle, options, resume, setup_optime)
            .await
        {
            // Commit finalized inside the commit step.
            Ok(_stats) => {}
            Err(err) => self.handle_build_failure(&handle, options, err).await,
        }
    }

    async fn run_phases(
        &self,
        handle: &BuildHandle,
        _options: BuildOptions,
        resume: Option<ResumeCheckpoint>,
        setup_optime: Option<OpTime>,
    ) -> Result<CatalogStats> {
        let record = &handle.record;
        let build_id = record.build_id;
        let collection_id = record.collection_id;

        // A build only checkpoints once everything preceding its bulk-load
        // state is majority-committed; on timeout it degrades to
        // non-resumable and continues.
        if let Some(optime) = setup_optime {
            if self.config.resumable_builds {
                use arbor_db_replication::ReplicationError;
                match self
                    .repl
                    .wait_until_majority(optime, self.config.majority_wait_timeout)
                    .await
                {
                    Ok(()) => handle.set_resumable(true),
                    Err(ReplicationError::MajorityWaitTimeout { .. }) => {
                        warn!(
                            build_id = %build_id,
                            "Index build: timed out waiting for the majority commit point, \
                             continuing as non-resumable"
                        );
                        handle.set_resumable(false);
                        self.persistence.remove_checkpoint(build_id).await?;
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }

        // Scanning
        handle.set_phase(BuildPhase::CollectionScan);
        self.hooks.reached(BuildCheckpoint::BeforeScan, build_id);
        handle.check_for_interrupt()?;
        let resume_after = resume.as_ref().and_then(|c| c.scan_position);
        if let Some(checkpoint) = &resume {
            info!(
                build_id = %build_id,
                phase = ?checkpoint.phase,
                "Index build: resuming from checkpoint"
            );
        }
        {
            let _intent = self.collection_intent_with_retries(collection_id).await?;
            self.mechanics
                .start_building(collection_id, build_id, resume_after)
                .await?;
        }
        handle.set_phase(BuildPhase::BulkLoad);
        self.hooks.reached(BuildCheckpoint::AfterScan, build_id);
        handle.check_for_interrupt()?;

        // Draining (non-blocking): only an intent lock, foreground traffic
        // keeps flowing.
        handle.set_phase(BuildPhase::Drain);
        {
            let _intent = self.collection_intent_with_retries(collection_id).await?;
            self.mechanics
                .drain(build_id, DrainReadSource::Latest, DrainYieldPolicy::AutoYield)
                .await?;
        }
        self.hooks
            .reached(BuildCheckpoint::AfterSideWritesDrain, build_id);
        handle.check_for_interrupt()?;

        // Awaiting commit readiness
        if record.is_two_phase() {
            if self.repl.is_primary_for(&record.db_name) {
                self.vote_commit_ready(build_id, &self.config.member_name)
                    .await?;
            } else {
                self.repl
                    .signal_commit_ready(build_id, &self.config.member_name)
                    .await?;
            }
        }
        self.hooks
            .reached(BuildCheckpoint::AfterCommitReadiness, build_id);

        // Draining (blocking): final catch-up under a lock that excludes new
        // writes to the collection.
        {
            let policy = self.lock_policy();
            with_retries(&policy, "blocking drain", || async {
                let _guards = self
                    .acquire_exclusive(collection_id, record.is_two_phase())
                    .await?;
                handle.check_for_interrupt()?;
                self.mechanics
                    .drain(build_id, DrainReadSource::Latest, DrainYieldPolicy::NoYield)
                    .await
            })
            .await?;
        }

        // CommitOrAbort: wait for a commit signal (quorum, oplog, or the
        // single-phase fast path) or an abort from any trigger. Sub-second
        // polling re-checks the replication role between signals.
        if !record.is_two_phase() {
            handle.try_commit(BuildAction::SinglePhaseCommit);
        }
        loop {
            handle.check_for_interrupt()?;
            if handle.action().is_some_and(|a| a.is_commit()) {
                break;
            }
            handle
                .wait_for_signal(self.config.commit_wait_poll_interval)
                .await;
        }

        self.commit_build(handle).await
    }

    async fn commit_build(&self, handle: &BuildHandle) -> Result<CatalogStats> {
        let record = &handle.record;
        let build_id = record.build_id;
        let collection_id = record.collection_id;
        self.hooks.reached(BuildCheckpoint::BeforeCommit, build_id);
        let action = handle.action().unwrap_or(BuildAction::SinglePhaseCommit);

        let stats = with_retries(&self.lock_policy(), "index build commit", || async {
            let _guards = self
                .acquire_exclusive(collection_id, record.is_two_phase())
                .await?;
            // Last drain, constraint re-validation, oplog entry and catalog
            // flip are one locked atomic unit.
            self.mechanics
                .drain(build_id, DrainReadSource::Latest, DrainYieldPolicy::NoYield)
                .await?;
            self.mechanics
                .check_constraints(collection_id, build_id)
                .await?;
            if record.is_two_phase() && action == BuildAction::CommitQuorumSatisfied {
                if !self.repl.is_primary_for(&record.db_name) {
                    return Err(IndexBuildError::NotPrimary(format!(
                        "lost primary status before committing index build {build_id}"
                    )));
                }
                self.repl
                    .replicate(IndexBuildOplogEntry::CommitIndexBuild {
                        collection_id,
                        build_id,
                        index_specs: record.raw_specs(),
                    })
                    .await?;
            }
            self.mechanics.commit(collection_id, build_id).await
        })
        .await?;

        if record.is_two_phase() {
            self.persistence.remove_entry(build_id).await?;
            self.persistence.remove_checkpoint(build_id).await?;
        }
        info!(
            build_id = %build_id,
            collection_id = %collection_id,
            indexes_before = stats.indexes_before,
            indexes_after = stats.indexes_after,
            "Index build: completed successfully"
        );
        handle.finish(Ok(stats));
        self.registry.unregister(build_id);
        Ok(stats)
    }

    // =========================================================================
    // Failure routing
    // =========================================================================

    async fn handle_build_failure(
        &self,
        handle: &BuildHandle,
        options: BuildOptions,
        err: IndexBuildError,
    ) {
        let record = &handle.record;
        let build_id = record.build_id;

        match handle.state() {
            // An external abort won arbitration; its caller performed the
            // teardown, fulfilled the completion signal and unregistered.
            BuildState::ExternallyAborting | BuildState::Aborted | BuildState::Committed => {
                debug!(
                    build_id = %build_id,
                    "Index build: pipeline exiting after external decision"
                );
                return;
            }
            _ => {}
        }

        if err.is_ignorable(options.relaxed_constraints) {
            // The requested index exists (or acceptably conflicts):
            // short-circuit to success after dropping this build's catalog
            // entry.
            info!(
                build_id = %build_id,
                error = %err,
                "Index build: ignoring indexing error"
            );
            if let Err(cleanup_err) = self.teardown_catalog(handle, false, "").await {
                protocol_violation("ignorable error cleanup", &cleanup_err.to_string());
            }
            let count = self
                .mechanics
                .num_ready_indexes(record.collection_id)
                .await
                .unwrap_or(0);
            handle.finish(Ok(CatalogStats {
                indexes_before: count,
                indexes_after: count,
            }));
            self.registry.unregister(build_id);
            return;
        }

        self.self_abort_build(handle, err).await;
    }

    async fn self_abort_build(&self, handle: &BuildHandle, err: IndexBuildError) {
        let record = &handle.record;
        let build_id = record.build_id;
        let reason = handle.abort_reason().unwrap_or_else(|| err.to_string());
        warn!(
            build_id = %build_id,
            collection_id = %record.collection_id,
            error = %err,
            "Index build: failed"
        );

        let primary = self.repl.is_primary_for(&record.db_name);
        if record.is_two_phase() && !primary && self.repl.member_state().is_secondary() {
            // A steady-state secondary cannot decide a two-phase build's
            // fate: ask the primary to abort, then wait for the replicated
            // decision to arrive through the oplog.
            handle.begin_remote_decision_wait(&reason);
            if let Err(upcall_err) = self.repl.request_abort(build_id, &reason).await {
                warn!(
                    build_id = %build_id,
                    error = %upcall_err,
                    "Index build: abort upcall to primary failed"
                );
            }
            info!(
                build_id = %build_id,
                "Index build: waiting for the primary's abort decision"
            );
            let _ = handle.completion().wait().await;
            return;
        }

        if !handle.force_self_abort(&reason)
            && !handle.commit_failed(&reason)
            && handle.state() != BuildState::SelfAborting
        {
            // Lost the race against another finisher.
            return;
        }

        self.hooks
            .reached(BuildCheckpoint::BeforeAbortCleanup, build_id);
        let replicate_abort = record.is_two_phase() && primary;
        if let Err(cleanup_err) = self.teardown_catalog(handle, replicate_abort, &reason).await {
            // Partially torn-down build state cannot be recovered in-process.
            protocol_violation("self abort", &cleanup_err.to_string());
        }
        handle.finish(Err(IndexBuildError::BuildAborted { reason }));
        self.registry.unregister(build_id);
    }

    /// Remove the build from the catalog and persistence, replicating the
    /// abort entry when this node is the deciding primary.
    async fn teardown_catalog(
        &self,
        handle: &BuildHandle,
        replicate_abort: bool,
        reason: &str,
    ) -> Result<()> {
        let record = &handle.record;
        with_retries(&self.lock_policy(), "abort cleanup", || async {
            let _guards = self
                .acquire_exclusive(record.collection_id, record.is_two_phase())
                .await?;
            if handle.cleanup_required() {
                self.mechanics
                    .abort(record.collection_id, record.build_id)
                    .await?;
                if replicate_abort {
                    self.repl
                        .replicate(IndexBuildOplogEntry::AbortIndexBuild {
                            collection_id: record.collection_id,
                            build_id: record.build_id,
                            index_specs: record.raw_specs(),
                            cause: reason.to_string(),
                        })
                        .await?;
                }
            }
            self.persistence.remove_entry(record.build_id).await?;
            self.persistence.remove_checkpoint(record.build_id).await
        })
        .await
    }

    // =========================================================================
    // External aborts
    // =========================================================================

    /// Abort a build by UUID.
    ///
    /// Returns `Ok(true)` when the build ends up aborted — by this call, a
    /// previous one, or because it is no longer registered (abort always
    /// succeeds and is idempotent). Returns `Ok(false)` only when the build
    /// committed and cannot be aborted. Polls while the state machine
    /// reports a transient condition.
    pub async fn abort_build(
        &self,
        build_id: Uuid,
        action: BuildAction,
        reason: &str,
    ) -> Result<bool> {
        debug_assert!(!action.is_commit());
        loop {
            let Some(handle) = self.registry.get(build_id) else {
                debug!(build_id = %build_id, "Ignoring abort for unknown index build");
                return Ok(true);
            };
            let record = &handle.record;
            info!(build_id = %build_id, "Attempting to abort index build");

            let retry = {
                // Two-phase aborts hold the state transition lock so the role
                // cannot change under the decision; single-phase builds skip
                // it and may be aborted after a step-down.
                let guards = self
                    .acquire_exclusive(record.collection_id, record.is_two_phase())
                    .await;
                let _guards = match guards {
                    Ok(guards) => guards,
                    Err(err) if err.is_transient() => {
                        tokio::time::sleep(self.config.abort_retry_interval).await;
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let mut action = action;
                if record.is_two_phase() {
                    let member_state = self.repl.member_state();
                    if member_state.is_initial_sync() && action != BuildAction::RollbackAbort {
                        debug!(
                            build_id = %build_id,
                            from = ?action,
                            "Overriding abort signal for initial sync"
                        );
                        action = BuildAction::InitialSyncAbort;
                    }
                    if matches!(
                        action,
                        BuildAction::PrimaryAbort | BuildAction::TenantMigrationAbort
                    ) && !self.repl.is_primary_for(&record.db_name)
                    {
                        return Err(IndexBuildError::NotPrimary(format!(
                            "unable to abort index build {build_id} because we are not primary"
                        )));
                    }
                }

                match handle.try_abort(action, reason) {
                    TryAbort::NotAborted => return Ok(false),
                    TryAbort::AlreadyAborted => return Ok(true),
                    TryAbort::Retry => true,
                    TryAbort::ContinueAbort => {
                        self.hooks
                            .reached(BuildCheckpoint::BeforeAbortCleanup, build_id);
                        self.complete_external_abort(&handle, action, reason).await;
                        handle.finish(Err(IndexBuildError::BuildAborted {
                            reason: reason.to_string(),
                        }));
                        self.registry.unregister(build_id);
                        info!(build_id = %build_id, "Index build: aborted");
                        return Ok(true);
                    }
                }
            };
            if retry {
                tokio::time::sleep(self.config.abort_retry_interval).await;
            }
        }
    }

    /// Teardown for an external abort; the caller holds the collection lock
    /// and has won arbitration.
    async fn complete_external_abort(
        &self,
        handle: &BuildHandle,
        action: BuildAction,
        reason: &str,
    ) {
        let record = &handle.record;
        let build_id = record.build_id;
        if !handle.cleanup_required() {
            info!(
                build_id = %build_id,
                action = ?action,
                "Index build: abort cleanup not required"
            );
            return;
        }

        let result: Result<()> = async {
            match action {
                BuildAction::PrimaryAbort | BuildAction::TenantMigrationAbort => {
                    // Single-phase builds may be aborted after a step-down;
                    // they have no replicated cleanup to write.
                    let primary_or_single_phase = !record.is_two_phase()
                        || self.repl.is_primary_for(&record.db_name);
                    if !primary_or_single_phase {
                        protocol_violation(
                            "external abort",
                            &format!("primary abort of build {build_id} while not primary"),
                        );
                    }
                    self.mechanics
                        .abort(record.collection_id, build_id)
                        .await?;
                    if record.is_two_phase() {
                        self.repl
                            .replicate(IndexBuildOplogEntry::AbortIndexBuild {
                                collection_id: record.collection_id,
                                build_id,
                                index_specs: record.raw_specs(),
                                cause: reason.to_string(),
                            })
                            .await?;
                    }
                    self.persistence.remove_entry(build_id).await?;
                    self.persistence.remove_checkpoint(build_id).await?;
                }
                BuildAction::InitialSyncAbort => {
                    if !record.is_two_phase() || !self.repl.member_state().is_initial_sync() {
                        protocol_violation(
                            "external abort",
                            &format!("initial-sync abort of build {build_id} in the wrong state"),
                        );
                    }
                    self.mechanics
                        .abort(record.collection_id, build_id)
                        .await?;
                    self.persistence.remove_entry(build_id).await?;
                    self.persistence.remove_checkpoint(build_id).await?;
                }
                BuildAction::OplogAbort => {
                    if !record.is_two_phase() {
                        protocol_violation(
                            "external abort",
                            &format!("abort oplog entry for single-phase build {build_id}"),
                        );
                    }
                    self.mechanics
                        .abort(record.collection_id, build_id)
                        .await?;
                    self.persistence.remove_entry(build_id).await?;
                    self.persistence.remove_checkpoint(build_id).await?;
                }
                BuildAction::RollbackAbort => {
                    let member_state = self.repl.member_state();
                    if !record.is_two_phase()
                        || !(member_state.is_rollback() || member_state.is_initial_sync())
                    {
                        protocol_violation(
                            "external abort",
                            &format!("rollback abort of build {build_id} in the wrong state"),
                        );
                    }
                    // Physical cleanup is deferred until recovery replays the
                    // oplog; only in-memory state goes away here.
                    let position = self
                        .mechanics
                        .abort_without_cleanup(
                            record.collection_id,
                            build_id,
                            handle.is_resumable(),
                        )
                        .await?;
                    if handle.is_resumable() {
                        self.persistence
                            .save_checkpoint(ResumeCheckpoint {
                                build_id,
                                collection_id: record.collection_id,
                                db_name: record.db_name.clone(),
                                phase: handle.phase(),
                                index_specs: record.index_specs.clone(),
                                scan_position: position,
                                spill_files: Vec::new(),
                            })
                            .await?;
                    }
                }
                BuildAction::CommitQuorumSatisfied
                | BuildAction::OplogCommit
                | BuildAction::SinglePhaseCommit => {
                    protocol_violation(
                        "external abort",
                        &format!("commit action {action:?} reached abort cleanup"),
                    );
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!(build_id = %build_id, "Cleaned up index build after abort"),
            Err(err) => protocol_violation(
                "external abort",
                &format!(
                    "failed to abort index build {build_id} after partially tearing down state: {err}"
                ),
            ),
        }
    }

    // =========================================================================
    // Commit signaling
    // =========================================================================

    /// Record a commit-readiness vote; when quorum is satisfied the build is
    /// driven into its committing state.
    pub async fn vote_commit_ready(&self, build_id: Uuid, member: &str) -> Result<()> {
        let handle = self
            .registry
            .get(build_id)
            .ok_or(IndexBuildError::BuildNotFound(build_id))?;
        let votes = handle.add_ready_member(member);
        let required = handle
            .record
            .commit_quorum
            .required_votes(self.repl.voting_member_count());
        debug!(
            build_id = %build_id,
            member,
            votes,
            required,
            "Commit readiness vote recorded"
        );
        if votes >= required {
            while !handle.try_commit(BuildAction::CommitQuorumSatisfied) {
                tokio::time::sleep(self.config.commit_retry_interval).await;
            }
            info!(build_id = %build_id, "Index build: commit quorum satisfied");
        }
        Ok(())
    }

    // =========================================================================
    // Oplog application (secondaries and replay)
    // =========================================================================

    /// Apply a replicated lifecycle entry
    pub async fn apply_oplog_entry(self: &Arc<Self>, entry: IndexBuildOplogEntry) -> Result<()> {
        match entry {
            IndexBuildOplogEntry::StartIndexBuild {
                collection_id,
                build_id,
                index_specs,
            } => self.apply_start(collection_id, build_id, index_specs).await,
            IndexBuildOplogEntry::CommitIndexBuild {
                collection_id,
                build_id,
                index_specs,
            } => {
                self.apply_commit(collection_id, build_id, index_specs)
                    .await
            }
            IndexBuildOplogEntry::AbortIndexBuild { build_id, cause, .. } => {
                self.apply_abort(build_id, &cause).await
            }
        }
    }

    async fn apply_start(
        self: &Arc<Self>,
        collection_id: Uuid,
        build_id: Uuid,
        index_specs: Vec<serde_json::Value>,
    ) -> Result<()> {
        if self.registry.get(build_id).is_some() {
            // At-least-once delivery; a replayed start is a no-op.
            return Ok(());
        }
        let db_name = self.mechanics.database_of(collection_id).await?;
        let specs = index_specs.into_iter().map(IndexSpec).collect();
        let mut request =
            StartBuildRequest::new(db_name, collection_id, specs, BuildProtocol::TwoPhase)
                .with_build_id(build_id);
        request.mode = ApplicationMode::OplogApply;
        request.relaxed_constraints = true;
        // The build runs in the background until a commit or abort entry
        // arrives; the completion handle is not needed here.
        let _completion = self.start_index_build(request).await?;
        Ok(())
    }

    async fn apply_commit(
        self: &Arc<Self>,
        collection_id: Uuid,
        build_id: Uuid,
        index_specs: Vec<serde_json::Value>,
    ) -> Result<()> {
        let handle = match self.registry.get(build_id) {
            Some(handle) => handle,
            None if self.config.standalone_oplog_replay => {
                // Unfinished builds are not restarted in standalone replay,
                // so there is no builder to commit: restart it on the spot.
                info!(
                    build_id = %build_id,
                    "Index build: restarting paused build to apply commit entry"
                );
                let db_name = self.mechanics.database_of(collection_id).await?;
                let specs = index_specs.into_iter().map(IndexSpec).collect();
                let mut request = StartBuildRequest::new(
                    db_name,
                    collection_id,
                    specs,
                    BuildProtocol::TwoPhase,
                )
                .with_build_id(build_id);
                request.mode = ApplicationMode::Recovery;
                request.relaxed_constraints = true;
                let _completion = self.start_index_build(request).await?;
                self.registry
                    .get(build_id)
                    .ok_or(IndexBuildError::BuildNotFound(build_id))?
            }
            None => return Err(IndexBuildError::BuildNotFound(build_id)),
        };

        // Poll until the build accepts the committing state; none of the
        // conditions blocking it are long-lived.
        while !handle.try_commit(BuildAction::OplogCommit) {
            tokio::time::sleep(self.config.commit_retry_interval).await;
        }
        let outcome = handle.completion().wait().await;
        info!(build_id = %build_id, "Index build: joined after commit");
        outcome.map(|_| ())
    }

    async fn apply_abort(&self, build_id: Uuid, cause: &str) -> Result<()> {
        let reason = format!("abortIndexBuild oplog entry encountered: {cause}");
        if self
            .abort_build(build_id, BuildAction::OplogAbort, &reason)
            .await?
        {
            return Ok(());
        }
        // The build may already be in the midst of tearing down.
        debug!(
            build_id = %build_id,
            cause,
            "Index build: failed to abort while applying abort entry"
        );
        Ok(())
    }

    // =========================================================================
    // Bulk abort triggers
    // =========================================================================

    /// Abort every build on a collection; returns the UUIDs actually aborted
    pub async fn abort_collection_builds(
        &self,
        collection_id: Uuid,
        reason: &str,
    ) -> Result<Vec<Uuid>> {
        let mut aborted = Vec::new();
        for handle in self.registry.for_collection(collection_id) {
            if self
                .abort_build(handle.record.build_id, BuildAction::PrimaryAbort, reason)
                .await?
            {
                aborted.push(handle.record.build_id);
            }
        }
        Ok(aborted)
    }

    /// Abort every build on a database, then wait until none remain.
    ///
    /// Callers that must guarantee completion before returning (database
    /// drop) rely on the trailing wait: a build that could not be aborted
    /// because it was already committing is waited out instead.
    pub async fn abort_database_builds(
        &self,
        db_name: &str,
        reason: &str,
        deadline: Duration,
    ) -> Result<()> {
        for handle in self.registry.for_db(db_name) {
            let build_id = handle.record.build_id;
            if !self
                .abort_build(build_id, BuildAction::PrimaryAbort, reason)
                .await?
            {
                info!(
                    build_id = %build_id,
                    db_name,
                    "Index build: could not abort for database drop, waiting for completion"
                );
            }
        }
        let db_name = db_name.to_string();
        self.registry
            .await_none(move |b| b.record.db_name == db_name, deadline)
            .await
    }

    /// Abort every build belonging to a tenant (databases named
    /// `<tenant>_<suffix>` or exactly `<tenant>`)
    pub async fn abort_tenant_builds(&self, tenant: &str, reason: &str) -> Result<Vec<Uuid>> {
        let prefix = format!("{tenant}_");
        let matches = self
            .registry
            .filter(|b| b.record.db_name == tenant || b.record.db_name.starts_with(&prefix));
        let mut aborted = Vec::new();
        for handle in matches {
            if self
                .abort_build(
                    handle.record.build_id,
                    BuildAction::TenantMigrationAbort,
                    reason,
                )
                .await?
            {
                aborted.push(handle.record.build_id);
            }
        }
        Ok(aborted)
    }

    /// Abort every build ahead of initial sync
    pub async fn abort_all_for_initial_sync(&self, reason: &str) -> Result<()> {
        info!(reason, "About to abort all index builders running");
        for handle in self.registry.all() {
            let build_id = handle.record.build_id;
            if !self
                .abort_build(build_id, BuildAction::InitialSyncAbort, reason)
                .await?
            {
                // The index build may already be in the midst of tearing down.
                info!(
                    build_id = %build_id,
                    collection_id = %handle.record.collection_id,
                    "Index build: failed to abort index build for initial sync"
                );
            }
        }
        Ok(())
    }

    /// Force-abort every active build because disk space dropped below the
    /// floor; returns how many builds were actually killed.
    ///
    /// Short-circuits silently when no build is registered.
    pub async fn abort_all_for_disk_space(
        &self,
        available_bytes: i64,
        required_bytes: i64,
    ) -> usize {
        let builds = self.registry.all();
        if builds.is_empty() {
            return 0;
        }
        let reason = format!(
            "available disk space of {available_bytes} bytes is less than required minimum of {required_bytes}"
        );
        let mut killed = 0usize;
        for handle in builds {
            // Signals the build to abort itself; the pipeline observes the
            // flag at its next check-point and tears down.
            if handle.force_self_abort(&reason) {
                let _ = handle.completion().wait().await;
                killed += 1;
            }
        }
        warn!(
            killed,
            available_bytes, required_bytes, "Index builds: aborted due to insufficient disk space"
        );
        killed
    }

    /// Stop every two-phase build ahead of rollback, deferring physical
    /// cleanup to recovery. Returns the interrupted builds with enough
    /// detail to restart them.
    pub async fn stop_for_rollback(&self) -> Result<InterruptedBuilds> {
        info!("Stopping index builds before rollback");
        let mut stopped = InterruptedBuilds::default();
        for handle in self.registry.all() {
            let record = &handle.record;
            if !record.is_two_phase() {
                info!(
                    build_id = %record.build_id,
                    "Not stopping single phase index build"
                );
                continue;
            }
            if self
                .abort_build(record.build_id, BuildAction::RollbackAbort, "rollback")
                .await?
            {
                stopped.insert(
                    record.build_id,
                    InterruptedBuild {
                        collection_id: record.collection_id,
                        db_name: record.db_name.clone(),
                        index_specs: record.index_specs.clone(),
                    },
                );
            } else {
                // Already mid-teardown; leave it out of the restart set.
                info!(
                    build_id = %record.build_id,
                    "Index build: failed to abort index build before rollback"
                );
            }
        }
        Ok(stopped)
    }

    /// Interrupt every build for shutdown, as if the process had been
    /// killed: no replicated cleanup, no catalog writes. Resumable builds
    /// persist a checkpoint first; recovery resumes or rebuilds the rest.
    pub async fn abort_all_for_shutdown(&self) {
        for handle in self.registry.all() {
            let record = &handle.record;
            let build_id = record.build_id;
            info!(build_id = %build_id, "Index build: interrupting for shutdown");
            let resumable = record.is_two_phase() && handle.is_resumable();
            match self
                .mechanics
                .abort_without_cleanup(record.collection_id, build_id, resumable)
                .await
            {
                Ok(position) if resumable => {
                    let checkpoint = ResumeCheckpoint {
                        build_id,
                        collection_id: record.collection_id,
                        db_name: record.db_name.clone(),
                        phase: handle.phase(),
                        index_specs: record.index_specs.clone(),
                        scan_position: position,
                        spill_files: Vec::new(),
                    };
                    if let Err(err) = self.persistence.save_checkpoint(checkpoint).await {
                        warn!(
                            build_id = %build_id,
                            error = %err,
                            "Index build: failed to persist resume checkpoint at shutdown"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(
                    build_id = %build_id,
                    error = %err,
                    "Index build: failed to interrupt for shutdown"
                ),
            }
            handle.finish(Err(IndexBuildError::Shutdown));
            self.registry.unregister(build_id);
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Restart or resume builds after a restart or rollback.
    ///
    /// Checkpointed builds are resumed from their phase first; a build whose
    /// resume fails falls back to a clean restart. Everything else in
    /// `to_restart` is restarted from scratch. All builds then wait for a
    /// replicated commit or abort as usual.
    pub async fn restart_or_resume_for_recovery(
        self: &Arc<Self>,
        to_restart: InterruptedBuilds,
        to_resume: Vec<ResumeCheckpoint>,
    ) -> Result<()> {
        let mut resumed: HashSet<Uuid> = HashSet::new();
        for checkpoint in to_resume {
            let build_id = checkpoint.build_id;
            info!(
                build_id = %build_id,
                collection_id = %checkpoint.collection_id,
                phase = ?checkpoint.phase,
                "Index build: resuming"
            );
            let mut request = StartBuildRequest::new(
                checkpoint.db_name.clone(),
                checkpoint.collection_id,
                checkpoint.index_specs.clone(),
                BuildProtocol::TwoPhase,
            )
            .with_build_id(build_id);
            request.mode = ApplicationMode::Recovery;
            request.relaxed_constraints = true;
            request.resume = Some(checkpoint.clone());
            match self.start_index_build(request).await {
                Ok(_completion) => {
                    resumed.insert(build_id);
                }
                Err(err) => {
                    warn!(
                        build_id = %build_id,
                        error = %err,
                        "Index build: failed to resume, restarting instead"
                    );
                    for file in &checkpoint.spill_files {
                        info!(
                            build_id = %build_id,
                            file,
                            "Index build: removing resumable temp file"
                        );
                    }
                    let _ = self.persistence.remove_checkpoint(build_id).await;
                }
            }
        }

        for (build_id, build) in to_restart {
            if resumed.contains(&build_id) {
                continue;
            }
            info!(
                build_id = %build_id,
                collection_id = %build.collection_id,
                "Index build: restarting"
            );
            let mut request = StartBuildRequest::new(
                build.db_name,
                build.collection_id,
                build.index_specs,
                BuildProtocol::TwoPhase,
            )
            .with_build_id(build_id);
            request.mode = ApplicationMode::Recovery;
            request.relaxed_constraints = true;
            let _completion = self.start_index_build(request).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of registered builds
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether any build targets the collection
    pub fn is_in_progress_for_collection(&self, collection_id: Uuid) -> bool {
        !self.registry.for_collection(collection_id).is_empty()
    }

    /// Whether any build targets the database
    pub fn is_in_progress_for_db(&self, db_name: &str) -> bool {
        !self.registry.for_db(db_name).is_empty()
    }

    /// Wait until no build targets the collection
    pub async fn await_no_builds_for_collection(
        &self,
        collection_id: Uuid,
        deadline: Duration,
    ) -> Result<()> {
        self.registry
            .await_none(move |b| b.record.collection_id == collection_id, deadline)
            .await
    }

    /// Wait until no build targets the database
    pub async fn await_no_builds_for_db(&self, db_name: &str, deadline: Duration) -> Result<()> {
        let db_name = db_name.to_string();
        self.registry
            .await_none(move |b| b.record.db_name == db_name, deadline)
            .await
    }
}
