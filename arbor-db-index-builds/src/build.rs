//! Build records and the immutable identity of an index build

use crate::error::{IndexBuildError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An index specification, a JSON document such as
/// `{"name": "a_1", "key": {"a": 1}}`.
///
/// The coordinator only interprets `name` and `key`; everything else is
/// carried opaquely for the index mechanics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSpec(pub serde_json::Value);

impl IndexSpec {
    /// The index name, if present and non-empty
    pub fn name(&self) -> Option<&str> {
        self.0
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// The key document, if present
    pub fn key(&self) -> Option<&serde_json::Value> {
        self.0.get("key")
    }

    /// Whether two specs describe the same index (same key document)
    pub fn same_key(&self, other: &IndexSpec) -> bool {
        self.key() == other.key()
    }
}

impl From<serde_json::Value> for IndexSpec {
    fn from(value: serde_json::Value) -> Self {
        IndexSpec(value)
    }
}

/// How a build's commit/abort decision is coordinated across the replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildProtocol {
    /// No cross-node quorum step; cannot survive losing primary status
    SinglePhase,
    /// Replicated start/commit/abort entries and a commit-quorum vote
    TwoPhase,
}

/// The resumability checkpoint a build has most recently passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildPhase {
    /// Registered and set up, not yet scanning
    Initialized,
    /// Forward collection scan feeding the bulk loader
    CollectionScan,
    /// Bulk-loading sorted keys into the index structure
    BulkLoad,
    /// Applying side writes that landed during the scan
    Drain,
}

/// Commit-quorum descriptor for a two-phase build.
///
/// Persisted alongside the build entry so secondaries can independently
/// decide when to vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitQuorum {
    /// All voting members must be ready
    VotingMembers,
    /// An explicit number of members must be ready
    Majority,
    /// An explicit member count
    Count(u32),
}

impl CommitQuorum {
    /// Number of ready votes required given the set's voting-member count
    pub fn required_votes(&self, voting_members: usize) -> usize {
        match self {
            CommitQuorum::VotingMembers => voting_members.max(1),
            CommitQuorum::Majority => voting_members / 2 + 1,
            CommitQuorum::Count(n) => (*n as usize).clamp(1, voting_members.max(1)),
        }
    }
}

impl Default for CommitQuorum {
    fn default() -> Self {
        CommitQuorum::VotingMembers
    }
}

/// Index counts observed at the build's terminal catalog write.
///
/// A build that completes as a no-op (all requested indexes already existed)
/// reports `indexes_after == indexes_before`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Ready indexes on the collection before the build
    pub indexes_before: usize,
    /// Ready indexes on the collection after the build
    pub indexes_after: usize,
}

/// Position within a collection scan, for resume checkpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanPosition(pub u64);

/// Immutable identity of one index-build attempt.
///
/// Everything here is fixed at registration; the mutable lifecycle lives in
/// [`crate::lifecycle::Lifecycle`] next to it inside the registry entry.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    /// Unique identifier of this build attempt
    pub build_id: Uuid,
    /// Target collection
    pub collection_id: Uuid,
    /// Database holding the target collection
    pub db_name: String,
    /// Ordered, non-empty index specs
    pub index_specs: Vec<IndexSpec>,
    /// Index names, parallel to `index_specs`
    pub index_names: Vec<String>,
    /// Commit/abort coordination protocol
    pub protocol: BuildProtocol,
    /// Commit quorum (two-phase only)
    pub commit_quorum: CommitQuorum,
}

impl BuildRecord {
    /// Validate specs and assemble a record.
    ///
    /// Fails if the spec list is empty, any spec lacks a non-empty name, or
    /// two specs share a name.
    pub fn new(
        build_id: Uuid,
        collection_id: Uuid,
        db_name: impl Into<String>,
        index_specs: Vec<IndexSpec>,
        protocol: BuildProtocol,
        commit_quorum: CommitQuorum,
    ) -> Result<Self> {
        if index_specs.is_empty() {
            return Err(IndexBuildError::InvalidOptions(
                "index build requires at least one spec".to_string(),
            ));
        }
        let mut index_names = Vec::with_capacity(index_specs.len());
        for spec in &index_specs {
            let name = spec.name().ok_or_else(|| {
                IndexBuildError::InvalidOptions("every index spec needs a non-empty name".into())
            })?;
            if index_names.iter().any(|n| n == name) {
                return Err(IndexBuildError::InvalidOptions(format!(
                    "duplicate index name in build: {name}"
                )));
            }
            index_names.push(name.to_string());
        }
        Ok(Self {
            build_id,
            collection_id,
            db_name: db_name.into(),
            index_specs,
            index_names,
            protocol,
            commit_quorum,
        })
    }

    /// Whether this is a two-phase build
    pub fn is_two_phase(&self) -> bool {
        self.protocol == BuildProtocol::TwoPhase
    }

    /// Raw spec documents, for oplog entries
    pub fn raw_specs(&self) -> Vec<serde_json::Value> {
        self.index_specs.iter().map(|s| s.0.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, key: serde_json::Value) -> IndexSpec {
        IndexSpec(json!({"name": name, "key": key}))
    }

    #[test]
    fn test_record_requires_named_specs() {
        let err = BuildRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "app",
            vec![IndexSpec(json!({"key": {"a": 1}}))],
            BuildProtocol::TwoPhase,
            CommitQuorum::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IndexBuildError::InvalidOptions(_)));
    }

    #[test]
    fn test_record_rejects_duplicate_names() {
        let err = BuildRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "app",
            vec![spec("a_1", json!({"a": 1})), spec("a_1", json!({"b": 1}))],
            BuildProtocol::TwoPhase,
            CommitQuorum::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IndexBuildError::InvalidOptions(_)));
    }

    #[test]
    fn test_record_rejects_empty_specs() {
        let err = BuildRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "app",
            vec![],
            BuildProtocol::SinglePhase,
            CommitQuorum::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IndexBuildError::InvalidOptions(_)));
    }

    #[test]
    fn test_names_parallel_specs() {
        let record = BuildRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "app",
            vec![spec("a_1", json!({"a": 1})), spec("b_1", json!({"b": 1}))],
            BuildProtocol::TwoPhase,
            CommitQuorum::default(),
        )
        .unwrap();
        assert_eq!(record.index_names, vec!["a_1", "b_1"]);
    }

    #[test]
    fn test_commit_quorum_votes() {
        assert_eq!(CommitQuorum::VotingMembers.required_votes(3), 3);
        assert_eq!(CommitQuorum::Majority.required_votes(3), 2);
        assert_eq!(CommitQuorum::Majority.required_votes(5), 3);
        assert_eq!(CommitQuorum::Count(2).required_votes(3), 2);
        // Clamped to the set size and to at least one vote.
        assert_eq!(CommitQuorum::Count(9).required_votes(3), 3);
        assert_eq!(CommitQuorum::Count(0).required_votes(3), 1);
    }

    #[test]
    fn test_same_key_comparison() {
        let a = spec("a_1", json!({"a": 1}));
        let b = spec("other", json!({"a": 1}));
        let c = spec("a_1", json!({"a": -1}));
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
    }
}
