//! In-memory catalog and index build mechanics for tests and embedded use
//!
//! Stores per-collection catalog state (ready indexes, unfinished builds,
//! document counts) behind `Arc<RwLock>`. The build mechanics are simulated:
//! a "scan" advances a cursor to the end of the collection, a "drain" clears
//! the pending side-write counter, and constraint checking consults a planted
//! duplicate-key flag so tests can trigger the constraint-violation path.

use crate::build::{CatalogStats, IndexSpec, ScanPosition};
use crate::error::{resolve_spec_conflict, IndexBuildError, Result, SpecConflict};
use crate::mechanics::{DrainReadSource, DrainYieldPolicy, IndexBuildMechanics};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct UnfinishedBuild {
    specs: Vec<IndexSpec>,
    scanned_to: ScanPosition,
    /// Frozen builds survive abort_without_cleanup and await recovery
    frozen: bool,
}

#[derive(Debug, Default)]
struct CollectionEntry {
    db_name: String,
    doc_count: u64,
    /// Side writes accumulated since the last drain
    pending_side_writes: u64,
    ready: Vec<IndexSpec>,
    unfinished: HashMap<Uuid, UnfinishedBuild>,
    /// Test knob: the next constraint check fails with a duplicate key
    duplicate_key: bool,
}

/// In-memory catalog implementing [`IndexBuildMechanics`]
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    collections: Arc<RwLock<HashMap<Uuid, CollectionEntry>>>,
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("collections", &self.collections.read().len())
            .finish()
    }
}

impl MemoryCatalog {
    /// New empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection holding `doc_count` documents
    pub fn create_collection(&self, db_name: &str, collection_id: Uuid, doc_count: u64) {
        self.collections.write().insert(
            collection_id,
            CollectionEntry {
                db_name: db_name.to_string(),
                doc_count,
                ..CollectionEntry::default()
            },
        );
    }

    /// Append documents, counting them as side writes for unfinished builds
    pub fn insert_docs(&self, collection_id: Uuid, count: u64) {
        let mut collections = self.collections.write();
        if let Some(entry) = collections.get_mut(&collection_id) {
            entry.doc_count += count;
            if !entry.unfinished.is_empty() {
                entry.pending_side_writes += count;
            }
        }
    }

    /// Plant a duplicate key so the next constraint check fails
    pub fn plant_duplicate_key(&self, collection_id: Uuid) {
        if let Some(entry) = self.collections.write().get_mut(&collection_id) {
            entry.duplicate_key = true;
        }
    }

    /// Names of the ready indexes on a collection
    pub fn ready_index_names(&self, collection_id: Uuid) -> Vec<String> {
        self.collections
            .read()
            .get(&collection_id)
            .map(|e| {
                e.ready
                    .iter()
                    .filter_map(|s| s.name().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether an index is present and ready
    pub fn is_index_ready(&self, collection_id: Uuid, name: &str) -> bool {
        self.ready_index_names(collection_id)
            .iter()
            .any(|n| n == name)
    }

    /// Whether the collection still carries unfinished build state
    pub fn has_unfinished(&self, collection_id: Uuid) -> bool {
        self.collections
            .read()
            .get(&collection_id)
            .is_some_and(|e| !e.unfinished.is_empty())
    }

    fn with_collection<T>(
        &self,
        collection_id: Uuid,
        f: impl FnOnce(&mut CollectionEntry) -> Result<T>,
    ) -> Result<T> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(&collection_id)
            .ok_or(IndexBuildError::CollectionNotFound(collection_id))?;
        f(entry)
    }
}

#[async_trait]
impl IndexBuildMechanics for MemoryCatalog {
    async fn collection_exists(&self, collection_id: Uuid) -> bool {
        self.collections.read().contains_key(&collection_id)
    }

    async fn database_of(&self, collection_id: Uuid) -> Result<String> {
        self.collections
            .read()
            .get(&collection_id)
            .map(|e| e.db_name.clone())
            .ok_or(IndexBuildError::CollectionNotFound(collection_id))
    }

    async fn num_ready_indexes(&self, collection_id: Uuid) -> Result<usize> {
        self.with_collection(collection_id, |entry| Ok(entry.ready.len()))
    }

    async fn prune_existing(
        &self,
        collection_id: Uuid,
        specs: &[IndexSpec],
        relaxed: bool,
    ) -> Result<Vec<IndexSpec>> {
        self.with_collection(collection_id, |entry| {
            let mut remaining = Vec::with_capacity(specs.len());
            for spec in specs {
                let name = spec.name().ok_or_else(|| {
                    IndexBuildError::InvalidOptions("index spec without a name".into())
                })?;
                let conflict = entry
                    .ready
                    .iter()
                    .find(|existing| existing.name() == Some(name))
                    .map(|existing| {
                        if existing.same_key(spec) {
                            SpecConflict::Duplicate
                        } else {
                            SpecConflict::OptionsMismatch
                        }
                    });
                if !resolve_spec_conflict(conflict, name, relaxed)? {
                    remaining.push(spec.clone());
                }
            }
            Ok(remaining)
        })
    }

    async fn set_up(&self, collection_id: Uuid, build_id: Uuid, specs: &[IndexSpec]) -> Result<()> {
        self.with_collection(collection_id, |entry| {
            entry.unfinished.insert(
                build_id,
                UnfinishedBuild {
                    specs: specs.to_vec(),
                    scanned_to: ScanPosition(0),
                    frozen: false,
                },
            );
            Ok(())
        })
    }

    async fn start_building(
        &self,
        collection_id: Uuid,
        build_id: Uuid,
        _resume_after: Option<ScanPosition>,
    ) -> Result<()> {
        self.with_collection(collection_id, |entry| {
            let end = ScanPosition(entry.doc_count);
            let build = entry
                .unfinished
                .get_mut(&build_id)
                .ok_or(IndexBuildError::BuildNotFound(build_id))?;
            build.frozen = false;
            // A resumed scan fast-forwards past the checkpointed prefix;
            // either way the cursor ends at the tail of the collection.
            build.scanned_to = end;
            Ok(())
        })
    }

    async fn drain(
        &self,
        build_id: Uuid,
        _read_source: DrainReadSource,
        _yield_policy: DrainYieldPolicy,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let entry = collections
            .values_mut()
            .find(|e| e.unfinished.contains_key(&build_id))
            .ok_or(IndexBuildError::BuildNotFound(build_id))?;
        entry.pending_side_writes = 0;
        Ok(())
    }

    async fn check_constraints(&self, collection_id: Uuid, build_id: Uuid) -> Result<()> {
        self.with_collection(collection_id, |entry| {
            if !entry.unfinished.contains_key(&build_id) {
                return Err(IndexBuildError::BuildNotFound(build_id));
            }
            if entry.duplicate_key {
                return Err(IndexBuildError::ConstraintViolation(format!(
                    "duplicate key found while building indexes on collection {collection_id}"
                )));
            }
            Ok(())
        })
    }

    async fn commit(&self, collection_id: Uuid, build_id: Uuid) -> Result<CatalogStats> {
        self.with_collection(collection_id, |entry| {
            let build = entry
                .unfinished
                .remove(&build_id)
                .ok_or(IndexBuildError::BuildNotFound(build_id))?;
            let indexes_before = entry.ready.len();
            for spec in build.specs {
                let name = spec.name().map(str::to_string);
                if entry.ready.iter().any(|s| s.name() == name.as_deref()) {
                    continue;
                }
                entry.ready.push(spec);
            }
            Ok(CatalogStats {
                indexes_before,
                indexes_after: entry.ready.len(),
            })
        })
    }

    async fn abort(&self, collection_id: Uuid, build_id: Uuid) -> Result<()> {
        self.with_collection(collection_id, |entry| {
            entry.unfinished.remove(&build_id);
            Ok(())
        })
    }

    async fn abort_without_cleanup(
        &self,
        collection_id: Uuid,
        build_id: Uuid,
        resumable: bool,
    ) -> Result<Option<ScanPosition>> {
        self.with_collection(collection_id, |entry| {
            let build = entry
                .unfinished
                .get_mut(&build_id)
                .ok_or(IndexBuildError::BuildNotFound(build_id))?;
            build.frozen = true;
            Ok(resumable.then_some(build.scanned_to))
        })
    }

    async fn unfinished_specs(
        &self,
        collection_id: Uuid,
        build_id: Uuid,
    ) -> Result<Vec<IndexSpec>> {
        self.with_collection(collection_id, |entry| {
            entry
                .unfinished
                .get(&build_id)
                .map(|b| b.specs.clone())
                .ok_or(IndexBuildError::BuildNotFound(build_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, key: serde_json::Value) -> IndexSpec {
        IndexSpec(json!({"name": name, "key": key}))
    }

    #[tokio::test]
    async fn test_set_up_scan_commit() {
        let catalog = MemoryCatalog::new();
        let coll = Uuid::new_v4();
        let build = Uuid::new_v4();
        catalog.create_collection("app", coll, 100);

        catalog
            .set_up(coll, build, &[spec("a_1", json!({"a": 1}))])
            .await
            .unwrap();
        assert!(catalog.has_unfinished(coll));
        assert!(!catalog.is_index_ready(coll, "a_1"));

        catalog.start_building(coll, build, None).await.unwrap();
        let stats = catalog.commit(coll, build).await.unwrap();
        assert_eq!(stats.indexes_before, 0);
        assert_eq!(stats.indexes_after, 1);
        assert!(catalog.is_index_ready(coll, "a_1"));
        assert!(!catalog.has_unfinished(coll));
    }

    #[tokio::test]
    async fn test_prune_existing_duplicate() {
        let catalog = MemoryCatalog::new();
        let coll = Uuid::new_v4();
        let build = Uuid::new_v4();
        catalog.create_collection("app", coll, 0);
        catalog
            .set_up(coll, build, &[spec("a_1", json!({"a": 1}))])
            .await
            .unwrap();
        catalog.commit(coll, build).await.unwrap();

        let remaining = catalog
            .prune_existing(
                coll,
                &[spec("a_1", json!({"a": 1})), spec("b_1", json!({"b": 1}))],
                false,
            )
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name(), Some("b_1"));
    }

    #[tokio::test]
    async fn test_prune_existing_conflict_enforced_vs_relaxed() {
        let catalog = MemoryCatalog::new();
        let coll = Uuid::new_v4();
        let build = Uuid::new_v4();
        catalog.create_collection("app", coll, 0);
        catalog
            .set_up(coll, build, &[spec("a_1", json!({"a": 1}))])
            .await
            .unwrap();
        catalog.commit(coll, build).await.unwrap();

        let clashing = [spec("a_1", json!({"a": -1}))];
        let err = catalog
            .prune_existing(coll, &clashing, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexBuildError::IndexOptionsConflict { .. }));

        let remaining = catalog.prune_existing(coll, &clashing, true).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_constraint_violation_knob() {
        let catalog = MemoryCatalog::new();
        let coll = Uuid::new_v4();
        let build = Uuid::new_v4();
        catalog.create_collection("app", coll, 10);
        catalog
            .set_up(coll, build, &[spec("a_1", json!({"a": 1}))])
            .await
            .unwrap();
        catalog.plant_duplicate_key(coll);
        let err = catalog.check_constraints(coll, build).await.unwrap_err();
        assert!(matches!(err, IndexBuildError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_abort_without_cleanup_freezes() {
        let catalog = MemoryCatalog::new();
        let coll = Uuid::new_v4();
        let build = Uuid::new_v4();
        catalog.create_collection("app", coll, 50);
        catalog
            .set_up(coll, build, &[spec("a_1", json!({"a": 1}))])
            .await
            .unwrap();
        catalog.start_building(coll, build, None).await.unwrap();

        let pos = catalog
            .abort_without_cleanup(coll, build, true)
            .await
            .unwrap();
        assert_eq!(pos, Some(ScanPosition(50)));
        // Unfinished state survives for recovery.
        assert!(catalog.has_unfinished(coll));
        assert_eq!(
            catalog.unfinished_specs(coll, build).await.unwrap().len(),
            1
        );
    }
}
