//! Coordinator configuration

use std::time::Duration;

/// Configuration for the index-builds coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bounded wait when enqueueing behind the replication state transition
    /// lock. On timeout the phase releases every lock it holds and retries
    /// from scratch, so this stays short.
    ///
    /// Default: 500ms
    pub state_transition_lock_timeout: Duration,

    /// Bounded wait for an exclusive or intent collection lock.
    ///
    /// Default: 5s
    pub collection_lock_timeout: Duration,

    /// Poll interval while a build sits in the commit/abort wait, re-checking
    /// the replication role between signals.
    ///
    /// Default: 250ms (sub-second by design; there is no hard deadline)
    pub commit_wait_poll_interval: Duration,

    /// Backoff between attempts when an external abort observes a transient
    /// arbitration state (`Retry`).
    ///
    /// Default: 1s
    pub abort_retry_interval: Duration,

    /// Backoff between attempts when an oplog commit application cannot yet
    /// put the build into its committing state.
    ///
    /// Default: 100ms
    pub commit_retry_interval: Duration,

    /// Maximum attempts for lock-acquisition retry loops before the error is
    /// escalated at a hard boundary.
    ///
    /// Default: 20
    pub max_lock_retries: u32,

    /// How long a resumable build waits for its setup optime to become
    /// majority-committed before degrading to non-resumable and continuing.
    ///
    /// Default: 10s
    pub majority_wait_timeout: Duration,

    /// Whether two-phase builds persist resume checkpoints at all.
    ///
    /// Default: true
    pub resumable_builds: bool,

    /// Disk-space floor for the periodic monitor; builds are force-aborted
    /// when available bytes drop below this.
    ///
    /// Default: 500 MB
    pub min_available_disk_bytes: i64,

    /// This node's member identifier, used for commit-quorum voting.
    ///
    /// Default: "node-0"
    pub member_name: String,

    /// Standalone oplog-replay mode: applying a commit entry for a build
    /// that was never restarted restarts it on the spot instead of failing.
    ///
    /// Default: false
    pub standalone_oplog_replay: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            state_transition_lock_timeout: Duration::from_millis(500),
            collection_lock_timeout: Duration::from_secs(5),
            commit_wait_poll_interval: Duration::from_millis(250),
            abort_retry_interval: Duration::from_secs(1),
            commit_retry_interval: Duration::from_millis(100),
            max_lock_retries: 20,
            majority_wait_timeout: Duration::from_secs(10),
            resumable_builds: true,
            min_available_disk_bytes: 500 * 1024 * 1024,
            member_name: "node-0".to_string(),
            standalone_oplog_replay: false,
        }
    }
}

impl CoordinatorConfig {
    /// Configuration with tight intervals for tests
    pub fn fast() -> Self {
        Self {
            state_transition_lock_timeout: Duration::from_millis(50),
            collection_lock_timeout: Duration::from_millis(200),
            commit_wait_poll_interval: Duration::from_millis(10),
            abort_retry_interval: Duration::from_millis(10),
            commit_retry_interval: Duration::from_millis(5),
            max_lock_retries: 10,
            majority_wait_timeout: Duration::from_millis(100),
            resumable_builds: true,
            min_available_disk_bytes: 1024,
            member_name: "node-0".to_string(),
            standalone_oplog_replay: false,
        }
    }

    /// Builder method to set the commit/abort wait poll interval
    pub fn with_commit_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.commit_wait_poll_interval = interval;
        self
    }

    /// Builder method to set the majority wait timeout
    pub fn with_majority_wait_timeout(mut self, timeout: Duration) -> Self {
        self.majority_wait_timeout = timeout;
        self
    }

    /// Builder method to disable resumable builds
    pub fn with_resumable_builds(mut self, enabled: bool) -> Self {
        self.resumable_builds = enabled;
        self
    }

    /// Builder method to set the disk-space floor
    pub fn with_min_available_disk_bytes(mut self, bytes: i64) -> Self {
        self.min_available_disk_bytes = bytes;
        self
    }

    /// Builder method to set this node's member identifier
    pub fn with_member_name(mut self, name: impl Into<String>) -> Self {
        self.member_name = name.into();
        self
    }

    /// Builder method to enable standalone oplog-replay mode
    pub fn with_standalone_oplog_replay(mut self, enabled: bool) -> Self {
        self.standalone_oplog_replay = enabled;
        self
    }
}
