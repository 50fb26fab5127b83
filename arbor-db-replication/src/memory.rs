//! In-memory replication coordinator for tests and embedded deployments
//!
//! Stores the oplog, member state and majority watermark in memory behind
//! `Arc<RwLock>`, making it thread-safe and cheap to clone. Tests use the
//! extra accessors (`entries`, `commit_ready_votes`, `abort_requests`) to
//! assert on the protocol traffic a build generated.

use crate::{
    IndexBuildOplogEntry, MemberState, OpTime, ReplicationCoordinator, ReplicationError, Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// In-memory replication coordinator.
///
/// Defaults to a single-voter primary whose writes majority-commit
/// immediately; tests exercising secondaries or stalled majorities flip the
/// member state or hold the watermark back explicitly.
#[derive(Clone)]
pub struct MemoryReplication {
    state: Arc<RwLock<MemberState>>,
    log: Arc<RwLock<Vec<(OpTime, IndexBuildOplogEntry)>>>,
    voting_members: Arc<RwLock<usize>>,
    /// When true, `replicate` does not advance the majority watermark
    hold_majority: Arc<RwLock<bool>>,
    majority_tx: Arc<watch::Sender<OpTime>>,
    votes: Arc<RwLock<Vec<(Uuid, String)>>>,
    abort_requests: Arc<RwLock<Vec<(Uuid, String)>>>,
}

impl Default for MemoryReplication {
    fn default() -> Self {
        let (majority_tx, _majority_rx) = watch::channel(OpTime::default());
        Self {
            state: Arc::new(RwLock::new(MemberState::Primary)),
            log: Arc::new(RwLock::new(Vec::new())),
            voting_members: Arc::new(RwLock::new(1)),
            hold_majority: Arc::new(RwLock::new(false)),
            majority_tx: Arc::new(majority_tx),
            votes: Arc::new(RwLock::new(Vec::new())),
            abort_requests: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Debug for MemoryReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReplication")
            .field("state", &*self.state.read())
            .field("log_len", &self.log.read().len())
            .field("majority", &*self.majority_tx.borrow())
            .finish()
    }
}

impl MemoryReplication {
    /// New single-voter primary
    pub fn new() -> Self {
        Self::default()
    }

    /// New coordinator starting in the given state
    pub fn with_state(state: MemberState) -> Self {
        let repl = Self::default();
        *repl.state.write() = state;
        repl
    }

    /// Change the member state (simulates step-up / step-down / sync phases)
    pub fn set_member_state(&self, state: MemberState) {
        *self.state.write() = state;
    }

    /// Set the voting-member count used for commit-quorum resolution
    pub fn set_voting_members(&self, count: usize) {
        *self.voting_members.write() = count.max(1);
    }

    /// When held, replicated writes stop advancing the majority watermark
    /// until [`MemoryReplication::advance_majority_to_latest`] is called.
    pub fn hold_majority(&self, hold: bool) {
        *self.hold_majority.write() = hold;
    }

    /// Advance the majority watermark to the last applied entry
    pub fn advance_majority_to_latest(&self) {
        let latest = self.last_applied();
        self.majority_tx.send_if_modified(|w| {
            if latest > *w {
                *w = latest;
                true
            } else {
                false
            }
        });
    }

    /// Snapshot of every replicated entry, in log order
    pub fn entries(&self) -> Vec<IndexBuildOplogEntry> {
        self.log.read().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Commit-readiness votes received from secondaries, in arrival order
    pub fn commit_ready_votes(&self) -> Vec<(Uuid, String)> {
        self.votes.read().clone()
    }

    /// Abort requests received from secondaries, in arrival order
    pub fn abort_requests(&self) -> Vec<(Uuid, String)> {
        self.abort_requests.read().clone()
    }
}

#[async_trait]
impl ReplicationCoordinator for MemoryReplication {
    fn member_state(&self) -> MemberState {
        *self.state.read()
    }

    fn is_primary_for(&self, _db_name: &str) -> bool {
        self.state.read().is_primary()
    }

    fn last_applied(&self) -> OpTime {
        self.log.read().last().map(|(t, _)| *t).unwrap_or_default()
    }

    fn voting_member_count(&self) -> usize {
        *self.voting_members.read()
    }

    async fn wait_until_majority(&self, optime: OpTime, timeout: Duration) -> Result<()> {
        let mut rx = self.majority_tx.subscribe();
        let wait = rx.wait_for(|w| *w >= optime);
        // Discard the borrowed `watch::Ref` before matching so the borrow of
        // `rx` ends before `rx` is dropped.
        let outcome = tokio::time::timeout(timeout, wait)
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(_)) => Ok(()),
            // Sender dropped: coordinator torn down mid-wait
            Ok(Err(_)) => Err(ReplicationError::Shutdown),
            Err(_) => Err(ReplicationError::MajorityWaitTimeout { optime: optime.0 }),
        }
    }

    async fn replicate(&self, entry: IndexBuildOplogEntry) -> Result<OpTime> {
        if !self.state.read().is_primary() {
            return Err(ReplicationError::NotPrimary(format!(
                "cannot replicate {} for build {}",
                entry.op_name(),
                entry.build_id()
            )));
        }
        let optime = {
            let mut log = self.log.write();
            let optime = log.last().map(|(t, _)| t.next()).unwrap_or(OpTime(1));
            debug!(op = entry.op_name(), optime = %optime, "Replicated index build entry");
            log.push((optime, entry));
            optime
        };
        if !*self.hold_majority.read() {
            self.advance_majority_to_latest();
        }
        Ok(optime)
    }

    async fn signal_commit_ready(&self, build_id: Uuid, member: &str) -> Result<()> {
        self.votes.write().push((build_id, member.to_string()));
        Ok(())
    }

    async fn request_abort(&self, build_id: Uuid, reason: &str) -> Result<()> {
        self.abort_requests
            .write()
            .push((build_id, reason.to_string()));
        Ok(())
    }
}
