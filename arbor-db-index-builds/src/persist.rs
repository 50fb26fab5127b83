//! Durable build entries and resume checkpoints
//!
//! Two shapes live here. The build entry is the replicated-visibility record
//! kept while a two-phase build is in flight (one document per build, removed
//! once commit/abort is durable — absence after commit is final). The resume
//! checkpoint is written at shutdown/rollback for builds that still qualify
//! as resumable, and read back on restart to skip completed phases.

use crate::build::{BuildPhase, CommitQuorum, IndexSpec, ScanPosition};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Persisted record of an in-flight two-phase build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEntry {
    /// Build UUID
    pub build_id: Uuid,
    /// Target collection UUID
    pub collection_id: Uuid,
    /// Commit quorum, persisted so secondaries can decide when to vote
    pub commit_quorum: CommitQuorum,
    /// Names of the indexes being built
    pub index_names: Vec<String>,
}

/// Durable continuation state for a resumable build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCheckpoint {
    /// Build UUID
    pub build_id: Uuid,
    /// Target collection UUID
    pub collection_id: Uuid,
    /// Database holding the target collection
    pub db_name: String,
    /// Phase the build had completed when checkpointed
    pub phase: BuildPhase,
    /// Specs of the indexes being built
    pub index_specs: Vec<IndexSpec>,
    /// Last scanned position, when interrupted mid-scan
    pub scan_position: Option<ScanPosition>,
    /// Temporary spill files holding sorted key runs
    pub spill_files: Vec<String>,
}

/// Storage for build entries and resume checkpoints (external collaborator)
#[async_trait]
pub trait BuildPersistence: Send + Sync {
    /// Insert or replace the entry for a build
    async fn put_entry(&self, entry: BuildEntry) -> Result<()>;

    /// Remove a build's entry; removing an absent entry is not an error
    async fn remove_entry(&self, build_id: Uuid) -> Result<()>;

    /// All persisted entries
    async fn entries(&self) -> Result<Vec<BuildEntry>>;

    /// Insert or replace a resume checkpoint
    async fn save_checkpoint(&self, checkpoint: ResumeCheckpoint) -> Result<()>;

    /// Remove a build's checkpoint; removing an absent checkpoint is not an
    /// error
    async fn remove_checkpoint(&self, build_id: Uuid) -> Result<()>;

    /// Remove and return every checkpoint (consumed once at recovery)
    async fn take_checkpoints(&self) -> Result<Vec<ResumeCheckpoint>>;
}

/// In-memory persistence for tests and embedded deployments
#[derive(Clone, Default)]
pub struct MemoryBuildPersistence {
    entries: Arc<RwLock<HashMap<Uuid, BuildEntry>>>,
    checkpoints: Arc<RwLock<HashMap<Uuid, ResumeCheckpoint>>>,
}

impl std::fmt::Debug for MemoryBuildPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuildPersistence")
            .field("entries", &self.entries.read().len())
            .field("checkpoints", &self.checkpoints.read().len())
            .finish()
    }
}

impl MemoryBuildPersistence {
    /// New empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the checkpoints without consuming them (test helper)
    pub fn checkpoints(&self) -> Vec<ResumeCheckpoint> {
        self.checkpoints.read().values().cloned().collect()
    }
}

#[async_trait]
impl BuildPersistence for MemoryBuildPersistence {
    async fn put_entry(&self, entry: BuildEntry) -> Result<()> {
        self.entries.write().insert(entry.build_id, entry);
        Ok(())
    }

    async fn remove_entry(&self, build_id: Uuid) -> Result<()> {
        self.entries.write().remove(&build_id);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<BuildEntry>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    async fn save_checkpoint(&self, checkpoint: ResumeCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.build_id, checkpoint);
        Ok(())
    }

    async fn remove_checkpoint(&self, build_id: Uuid) -> Result<()> {
        self.checkpoints.write().remove(&build_id);
        Ok(())
    }

    async fn take_checkpoints(&self) -> Result<Vec<ResumeCheckpoint>> {
        let mut checkpoints = self.checkpoints.write();
        Ok(checkpoints.drain().map(|(_, c)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint(build_id: Uuid) -> ResumeCheckpoint {
        ResumeCheckpoint {
            build_id,
            collection_id: Uuid::new_v4(),
            db_name: "app".to_string(),
            phase: BuildPhase::CollectionScan,
            index_specs: vec![IndexSpec(json!({"name": "a_1", "key": {"a": 1}}))],
            scan_position: Some(ScanPosition(42)),
            spill_files: vec!["run.0.tmp".to_string()],
        }
    }

    #[tokio::test]
    async fn test_entry_lifecycle() {
        let store = MemoryBuildPersistence::new();
        let build_id = Uuid::new_v4();
        store
            .put_entry(BuildEntry {
                build_id,
                collection_id: Uuid::new_v4(),
                commit_quorum: CommitQuorum::VotingMembers,
                index_names: vec!["a_1".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(store.entries().await.unwrap().len(), 1);

        // Absence after removal is final; a second remove is a no-op.
        store.remove_entry(build_id).await.unwrap();
        store.remove_entry(build_id).await.unwrap();
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_checkpoints_drains() {
        let store = MemoryBuildPersistence::new();
        store.save_checkpoint(checkpoint(Uuid::new_v4())).await.unwrap();
        store.save_checkpoint(checkpoint(Uuid::new_v4())).await.unwrap();
        assert_eq!(store.take_checkpoints().await.unwrap().len(), 2);
        assert!(store.take_checkpoints().await.unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let c = checkpoint(Uuid::new_v4());
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["phase"], "CollectionScan");
        let back: ResumeCheckpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, c);
    }
}
