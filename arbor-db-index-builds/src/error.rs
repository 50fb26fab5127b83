//! Error types and classification for index builds
//!
//! The taxonomy matters more than the variants themselves: an error is either
//! *ignorable* (the build completes as a no-op success), *transient* (retried
//! with backoff at the phase that hit it), or *fatal to the build* (routed to
//! self-abort). Protocol violations are fatal to the process and never
//! represented as a value — see [`protocol_violation`].
//!
//! Every variant carries owned data and the enum is `Clone`: a build's
//! terminal error is fanned out through the completion signal to every waiter.

use thiserror::Error;
use uuid::Uuid;

/// Index build errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexBuildError {
    /// A build with this UUID is already registered
    #[error("Index build already registered: {0}")]
    AlreadyRegistered(Uuid),

    /// No registered build with this UUID
    #[error("No index build with UUID {0}")]
    BuildNotFound(Uuid),

    /// Target collection does not exist in the catalog
    #[error("Collection not found: {0}")]
    CollectionNotFound(Uuid),

    /// Requested index specs are malformed (empty, unnamed, duplicate names)
    #[error("Invalid index specs: {0}")]
    InvalidOptions(String),

    /// An index with the same name and options already exists (ignorable)
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// An index with the same name but different options exists
    #[error("Index {name} already exists with different options: {detail}")]
    IndexOptionsConflict { name: String, detail: String },

    /// Key generation or constraint checking found a violation (duplicate key,
    /// document validation). Fatal to the build, never to the node.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Node was not primary when a primary-only step ran (transient)
    #[error("Not primary: {0}")]
    NotPrimary(String),

    /// Bounded lock wait expired (transient; the phase releases everything
    /// and retries from scratch)
    #[error("Timed out waiting for {0} lock")]
    LockTimeout(&'static str),

    /// Available disk space dropped below the configured floor
    #[error("Insufficient disk space: {available} bytes available, {required} required")]
    OutOfDiskSpace { available: i64, required: i64 },

    /// The build was aborted; `reason` is the first writer's reason
    #[error("Index build aborted: {reason}")]
    BuildAborted { reason: String },

    /// Process is shutting down; in-memory state is discarded as if killed
    #[error("Index build interrupted by shutdown")]
    Shutdown,

    /// A deadline-bounded wait on the registry expired
    #[error("Timed out waiting for index builds to finish: {0}")]
    WaitTimeout(String),

    /// Error from the replication coordinator
    #[error("Replication error: {0}")]
    Replication(String),

    /// Error from the index build mechanics
    #[error("Index build mechanics error: {0}")]
    Mechanics(String),

    /// Error from the build persistence layer
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<arbor_db_replication::ReplicationError> for IndexBuildError {
    fn from(e: arbor_db_replication::ReplicationError) -> Self {
        use arbor_db_replication::ReplicationError;
        match e {
            ReplicationError::NotPrimary(msg) => IndexBuildError::NotPrimary(msg),
            ReplicationError::Shutdown => IndexBuildError::Shutdown,
            other => IndexBuildError::Replication(other.to_string()),
        }
    }
}

impl IndexBuildError {
    /// Whether the error is safe to swallow, completing the build as a no-op.
    ///
    /// `relaxed` is the constraint-relaxation flag: a secondary catching up to
    /// a primary with a different effective spec tolerates options conflicts
    /// that a user-facing create must reject.
    pub fn is_ignorable(&self, relaxed: bool) -> bool {
        match self {
            IndexBuildError::IndexAlreadyExists(_) => true,
            IndexBuildError::IndexOptionsConflict { .. } => relaxed,
            _ => false,
        }
    }

    /// Whether the error should be retried with backoff rather than
    /// escalated. Exhausting retries at a hard boundary turns these into
    /// abort triggers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexBuildError::NotPrimary(_) | IndexBuildError::LockTimeout(_)
        )
    }
}

/// Result type for index build operations
pub type Result<T> = std::result::Result<T, IndexBuildError>;

/// Outcome of comparing a requested spec against an existing ready index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecConflict {
    /// Same name, same key document: the requested index already exists
    Duplicate,
    /// Same name, different key/options: fatal unless constraints are relaxed
    OptionsMismatch,
}

/// The explicit ignorable-vs-fatal policy for spec conflicts.
///
/// | existing vs requested | enforced          | relaxed          |
/// |-----------------------|-------------------|------------------|
/// | same name, same key   | skip (ignorable)  | skip (ignorable) |
/// | same name, diff key   | options conflict  | skip (ignorable) |
///
/// Returns `Ok(true)` when the requested spec should be skipped, `Ok(false)`
/// when it should be built, and an error for an enforced mismatch.
pub fn resolve_spec_conflict(
    conflict: Option<SpecConflict>,
    name: &str,
    relaxed: bool,
) -> Result<bool> {
    match conflict {
        None => Ok(false),
        Some(SpecConflict::Duplicate) => Ok(true),
        Some(SpecConflict::OptionsMismatch) if relaxed => Ok(true),
        Some(SpecConflict::OptionsMismatch) => Err(IndexBuildError::IndexOptionsConflict {
            name: name.to_string(),
            detail: "existing index has a different key or options".to_string(),
        }),
    }
}

/// A replication-protocol invariant was broken: the node can no longer be
/// trusted to act as a correct replica, so this is fatal to the process, not
/// just the build.
pub fn protocol_violation(context: &str, detail: &str) -> ! {
    tracing::error!(context, detail, "Index build protocol violation");
    panic!("index build protocol violation in {context}: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignorable_classification() {
        let exists = IndexBuildError::IndexAlreadyExists("a_1".to_string());
        assert!(exists.is_ignorable(false));
        assert!(exists.is_ignorable(true));

        let conflict = IndexBuildError::IndexOptionsConflict {
            name: "a_1".to_string(),
            detail: "key".to_string(),
        };
        assert!(!conflict.is_ignorable(false));
        assert!(conflict.is_ignorable(true));

        let constraint = IndexBuildError::ConstraintViolation("dup".to_string());
        assert!(!constraint.is_ignorable(true));
    }

    #[test]
    fn test_transient_classification() {
        assert!(IndexBuildError::NotPrimary("x".into()).is_transient());
        assert!(IndexBuildError::LockTimeout("collection").is_transient());
        assert!(!IndexBuildError::Shutdown.is_transient());
        assert!(!IndexBuildError::ConstraintViolation("dup".into()).is_transient());
    }

    #[test]
    fn test_spec_conflict_policy_table() {
        // No existing index: build it, under either policy.
        assert!(!resolve_spec_conflict(None, "a_1", false).unwrap());
        assert!(!resolve_spec_conflict(None, "a_1", true).unwrap());

        // Exact duplicate: skip, under either policy.
        assert!(resolve_spec_conflict(Some(SpecConflict::Duplicate), "a_1", false).unwrap());
        assert!(resolve_spec_conflict(Some(SpecConflict::Duplicate), "a_1", true).unwrap());

        // Mismatch: fatal when enforced, skipped when relaxed.
        let err = resolve_spec_conflict(Some(SpecConflict::OptionsMismatch), "a_1", false)
            .unwrap_err();
        assert!(matches!(err, IndexBuildError::IndexOptionsConflict { .. }));
        assert!(resolve_spec_conflict(Some(SpecConflict::OptionsMismatch), "a_1", true).unwrap());
    }
}
