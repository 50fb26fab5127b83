//! Consumed interface to the physical index build machinery
//!
//! Key generation, sorting, the on-disk index structure and the durable
//! catalog all live behind this trait. The coordinator only sequences the
//! calls; it never sees a key or a record. Oplog replication happens in the
//! coordinator around these calls, not inside them.

use crate::build::{CatalogStats, IndexSpec, ScanPosition};
use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Which view of the collection a drain reads side writes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReadSource {
    /// Latest committed writes on this node
    Latest,
    /// Only majority-committed writes
    MajorityCommitted,
}

/// Whether a drain may yield its locks between batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainYieldPolicy {
    /// Yield between batches so foreground traffic is not starved
    AutoYield,
    /// Hold locks for the whole drain (final catch-up under exclusive lock)
    NoYield,
}

/// Physical index build mechanics (external collaborator).
///
/// All methods are keyed by `(collection_id, build_id)`; one build may cover
/// several indexes but is set up, drained, committed and aborted as a unit.
#[async_trait]
pub trait IndexBuildMechanics: Send + Sync {
    /// Whether the collection exists in the catalog
    async fn collection_exists(&self, collection_id: Uuid) -> bool;

    /// Database a collection belongs to (oplog entries carry only UUIDs)
    async fn database_of(&self, collection_id: Uuid) -> Result<String>;

    /// Ready index count on the collection
    async fn num_ready_indexes(&self, collection_id: Uuid) -> Result<usize>;

    /// Drop the specs that already exist as ready indexes.
    ///
    /// Returns the specs still to build. Under enforced constraints a
    /// same-name/different-options clash is an error; under relaxed
    /// constraints the clashing spec is skipped (secondary catch-up).
    async fn prune_existing(
        &self,
        collection_id: Uuid,
        specs: &[IndexSpec],
        relaxed: bool,
    ) -> Result<Vec<IndexSpec>>;

    /// Create the catalog entries and in-memory build state for a new build.
    /// After this returns the unfinished indexes are visible in the catalog.
    async fn set_up(&self, collection_id: Uuid, build_id: Uuid, specs: &[IndexSpec]) -> Result<()>;

    /// Run the collection scan, feeding keys into the bulk loader.
    /// `resume_after` skips everything up to and including that position.
    async fn start_building(
        &self,
        collection_id: Uuid,
        build_id: Uuid,
        resume_after: Option<ScanPosition>,
    ) -> Result<()>;

    /// Apply side writes that landed concurrently with the scan
    async fn drain(
        &self,
        build_id: Uuid,
        read_source: DrainReadSource,
        yield_policy: DrainYieldPolicy,
    ) -> Result<()>;

    /// Re-validate constraints (duplicate keys, skipped records) ahead of the
    /// final catalog write
    async fn check_constraints(&self, collection_id: Uuid, build_id: Uuid) -> Result<()>;

    /// Mark every index of the build ready in one atomic catalog mutation
    async fn commit(&self, collection_id: Uuid, build_id: Uuid) -> Result<CatalogStats>;

    /// Tear down the build and remove its catalog entries
    async fn abort(&self, collection_id: Uuid, build_id: Uuid) -> Result<()>;

    /// Discard in-memory state without touching the catalog (shutdown,
    /// rollback). Returns the scan position to checkpoint when `resumable`.
    async fn abort_without_cleanup(
        &self,
        collection_id: Uuid,
        build_id: Uuid,
        resumable: bool,
    ) -> Result<Option<ScanPosition>>;

    /// Specs of an unfinished build left behind in the catalog (recovery)
    async fn unfinished_specs(&self, collection_id: Uuid, build_id: Uuid)
        -> Result<Vec<IndexSpec>>;
}
