//! Storage backend capabilities.
//!
//! The snapshot and feedback stores are written against these traits so the
//! same registry, writer, query engine and log store run on PostgreSQL in
//! production and on the in-memory backend in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::geo::NearbyQuery;
use crate::models::*;
use crate::names::{ShardKey, VersionId};

// =============================================================================
// SNAPSHOT BACKEND
// =============================================================================

/// Relation-level operations on versioned snapshots.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Version named by the registry, the source of truth for "current".
    async fn registered_version(&self) -> Result<Option<VersionId>>;

    /// True when the published (fully materialized) relation exists.
    async fn snapshot_exists(&self, version: &VersionId) -> Result<bool>;

    /// Build `version` under its staging name from `batches` and publish it
    /// with one rename, all in a single unit of work.
    ///
    /// A failed or cancelled build leaves nothing behind. A concurrent build
    /// of the same version waits for the first to finish and then returns
    /// `MaterializeOutcome::AlreadyPresent`.
    async fn materialize(
        &self,
        version: &VersionId,
        batches: &[Vec<PointRecord>],
    ) -> Result<MaterializeOutcome>;

    /// Under the global cut-over lock, point the registry at `version`
    /// unless a newer version is already registered.
    async fn cutover(&self, version: &VersionId) -> Result<CutoverOutcome>;

    /// All published snapshot relations, in any order.
    async fn list_snapshots(&self) -> Result<Vec<VersionId>>;

    /// Retention pass under the global cut-over lock.
    ///
    /// Re-reads the registry, keeps the `keep` newest snapshots plus the
    /// current one, and drops the rest together with any staging relation
    /// left by an abandoned build. Individual drop failures land in the
    /// report; an error means the pass could not run at all.
    async fn drop_retired(&self, keep: usize) -> Result<GcReport>;

    /// Records of `version` inside the query box, nearest first, capped at
    /// `query.max`, computed next to the data.
    ///
    /// Returns `Error::NotFound` when the relation does not exist.
    async fn query_nearby(
        &self,
        version: &VersionId,
        query: &NearbyQuery,
    ) -> Result<Vec<NearbyPoint>>;
}

// =============================================================================
// FEEDBACK BACKEND
// =============================================================================

/// Relation-level operations on day-sharded feedback logs.
#[async_trait]
pub trait FeedbackBackend: Send + Sync {
    /// Existence probe for a shard relation.
    async fn shard_exists(&self, shard: &ShardKey) -> Result<bool>;

    /// Create the shard relation if absent.
    ///
    /// Returns `Error::ShardCreateRace` when a concurrent creator won; callers
    /// treat that as success.
    async fn create_shard(&self, shard: &ShardKey) -> Result<()>;

    /// Append one record to an existing shard.
    async fn insert_feedback(&self, shard: &ShardKey, record: &FeedbackRecord) -> Result<()>;

    /// Matching rows, newest first, windowed by `page`.
    async fn select_feedback(
        &self,
        shard: &ShardKey,
        filter: &FeedbackFilter,
        page: PageRequest,
    ) -> Result<Vec<FeedbackRecord>>;

    /// Count of all matching rows, ignoring any window.
    async fn count_feedback(&self, shard: &ShardKey, filter: &FeedbackFilter) -> Result<i64>;

    /// Static reference data.
    async fn list_options(&self) -> Result<Vec<FeedbackOption>>;
}
