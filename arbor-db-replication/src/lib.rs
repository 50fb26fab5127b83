//! Replication coordinator interface for Arbor DB
//!
//! This crate defines the boundary between node-local subsystems (such as the
//! index-build coordinator) and the replica-set machinery. It provides:
//!
//! - [`MemberState`]: the node's current role in the replica set
//! - [`OpTime`]: a logical position in the replicated operation log
//! - [`IndexBuildOplogEntry`]: the three replicated index-build lifecycle
//!   entries (`startIndexBuild`, `commitIndexBuild`, `abortIndexBuild`)
//! - [`ReplicationCoordinator`]: the consumed trait — role queries, majority
//!   waits, oplog writes, and the secondary-to-primary upcalls used by
//!   two-phase index builds
//!
//! # Implementations
//!
//! - [`MemoryReplication`]: in-memory implementation for tests and embedded
//!   single-node deployments

mod error;
pub mod memory;

pub use error::{ReplicationError, Result};
pub use memory::MemoryReplication;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// The node's current role in the replica set.
///
/// Index builds only care about a handful of the protocol states: whether the
/// node can originate replicated writes (`Primary`), whether it is applying
/// someone else's decisions (`Secondary`), and the two recovery modes that
/// change abort cleanup (`Rollback`, `InitialSync`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Node is starting up and has not joined the set yet
    Startup,
    /// Node accepts writes and replicates decisions to secondaries
    Primary,
    /// Node applies replicated decisions from the primary
    Secondary,
    /// Node is rolling back operations that were never majority-committed
    Rollback,
    /// Node is initial-syncing from another member
    InitialSync,
}

impl MemberState {
    /// Whether the node can originate replicated writes
    pub fn is_primary(&self) -> bool {
        matches!(self, MemberState::Primary)
    }

    /// Whether the node is a steady-state secondary
    pub fn is_secondary(&self) -> bool {
        matches!(self, MemberState::Secondary)
    }

    /// Whether the node is initial-syncing
    pub fn is_initial_sync(&self) -> bool {
        matches!(self, MemberState::InitialSync)
    }

    /// Whether the node is in rollback
    pub fn is_rollback(&self) -> bool {
        matches!(self, MemberState::Rollback)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Rollback => "ROLLBACK",
            MemberState::InitialSync => "INITIAL_SYNC",
        };
        f.write_str(s)
    }
}

/// A logical position in the replicated operation log.
///
/// Ordering is total; `OpTime::default()` sorts before every applied entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime(pub i64);

impl OpTime {
    /// The next position after this one
    pub fn next(self) -> OpTime {
        OpTime(self.0 + 1)
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A replicated index-build lifecycle entry.
///
/// These are the only index-build operations that travel through the oplog.
/// Order matters: secondaries apply them in log order, and application is
/// idempotent (a commit or abort for an unknown build is not an error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IndexBuildOplogEntry {
    /// A primary started a two-phase index build
    #[serde(rename_all = "camelCase")]
    StartIndexBuild {
        collection_id: Uuid,
        build_id: Uuid,
        index_specs: Vec<serde_json::Value>,
    },
    /// A primary decided the build commits
    #[serde(rename_all = "camelCase")]
    CommitIndexBuild {
        collection_id: Uuid,
        build_id: Uuid,
        index_specs: Vec<serde_json::Value>,
    },
    /// A primary decided the build aborts
    #[serde(rename_all = "camelCase")]
    AbortIndexBuild {
        collection_id: Uuid,
        build_id: Uuid,
        index_specs: Vec<serde_json::Value>,
        cause: String,
    },
}

impl IndexBuildOplogEntry {
    /// The build this entry is about
    pub fn build_id(&self) -> Uuid {
        match self {
            IndexBuildOplogEntry::StartIndexBuild { build_id, .. }
            | IndexBuildOplogEntry::CommitIndexBuild { build_id, .. }
            | IndexBuildOplogEntry::AbortIndexBuild { build_id, .. } => *build_id,
        }
    }

    /// The collection this entry is about
    pub fn collection_id(&self) -> Uuid {
        match self {
            IndexBuildOplogEntry::StartIndexBuild { collection_id, .. }
            | IndexBuildOplogEntry::CommitIndexBuild { collection_id, .. }
            | IndexBuildOplogEntry::AbortIndexBuild { collection_id, .. } => *collection_id,
        }
    }

    /// Short operation name for logging
    pub fn op_name(&self) -> &'static str {
        match self {
            IndexBuildOplogEntry::StartIndexBuild { .. } => "startIndexBuild",
            IndexBuildOplogEntry::CommitIndexBuild { .. } => "commitIndexBuild",
            IndexBuildOplogEntry::AbortIndexBuild { .. } => "abortIndexBuild",
        }
    }
}

/// Replication coordinator consumed by node-local subsystems.
///
/// Role queries are synchronous snapshots: the answer can be stale by the time
/// the caller acts on it, which is why callers re-check under the replication
/// state transition lock before any decision that requires a stable role.
#[async_trait]
pub trait ReplicationCoordinator: Send + Sync {
    /// Current member state (point-in-time snapshot)
    fn member_state(&self) -> MemberState;

    /// Whether this node currently accepts writes for `db_name`
    fn is_primary_for(&self, db_name: &str) -> bool;

    /// The last operation applied on this node
    fn last_applied(&self) -> OpTime;

    /// Number of voting members in the current replica-set configuration
    fn voting_member_count(&self) -> usize;

    /// Block until `optime` is majority-committed, or until `timeout`.
    ///
    /// Returns [`ReplicationError::MajorityWaitTimeout`] on timeout; callers
    /// decide whether that is fatal (it is not for resumable index builds,
    /// which degrade to non-resumable and continue).
    async fn wait_until_majority(&self, optime: OpTime, timeout: Duration) -> Result<()>;

    /// Write a lifecycle entry to the oplog. Primary only.
    async fn replicate(&self, entry: IndexBuildOplogEntry) -> Result<OpTime>;

    /// Secondary-to-primary upcall: this member is ready to vote for commit
    /// quorum on `build_id`.
    async fn signal_commit_ready(&self, build_id: Uuid, member: &str) -> Result<()>;

    /// Secondary-to-primary upcall: this member hit a build error it cannot
    /// resolve itself and asks the primary to abort `build_id`.
    async fn request_abort(&self, build_id: Uuid, reason: &str) -> Result<()>;
}
