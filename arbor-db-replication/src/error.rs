//! Error types for the replication interface

use thiserror::Error;

/// Replication errors
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// The node is not primary for the requested operation
    #[error("Not primary: {0}")]
    NotPrimary(String),

    /// A majority wait did not complete within its deadline
    #[error("Timed out waiting for optime t{optime} to become majority-committed")]
    MajorityWaitTimeout {
        /// The optime that was being waited on
        optime: i64,
    },

    /// The replication subsystem is shutting down
    #[error("Replication coordinator is shutting down")]
    Shutdown,

    /// The upcall target (primary) could not be reached
    #[error("Upcall to primary failed: {0}")]
    UpcallFailed(String),
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;
