//! In-memory backend for deterministic testing and embedded use.
//!
//! Implements both backend traits over process-local maps with the same
//! observable semantics as [`PgBackend`](crate::PgBackend). A build is one
//! critical section, so staging is never visible to other callers. Cut-over
//! and retention share the same lock and the pointer never moves backwards.
//! Nearby queries filter by box then sort by great-circle distance.
//!
//! ## Usage
//!
//! ```rust
//! use maskmap_db::memory::{FailPoint, MemoryBackend};
//!
//! let backend = MemoryBackend::new().with_failure(FailPoint::InsertBatch, 1);
//! assert_eq!(backend.snapshot_count(), 0);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use maskmap_core::{
    great_circle_miles, retention_split, CutoverOutcome, Error, FeedbackBackend, FeedbackFilter,
    FeedbackOption, FeedbackRecord, GcReport, MaterializeOutcome, NearbyPoint, NearbyQuery,
    PageRequest, PointRecord, Result, ShardKey, SnapshotBackend, VersionId,
};

/// Backend operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    RegistryRead,
    BeginStaging,
    InsertBatch,
    Publish,
    Cutover,
    /// The whole retention pass.
    Gc,
    /// One relation drop inside a retention pass.
    DropSnapshot,
    Query,
    ShardProbe,
    InsertFeedback,
}

#[derive(Default)]
struct State {
    registry: Option<VersionId>,
    snapshots: BTreeMap<VersionId, Vec<PointRecord>>,
    staging: BTreeMap<VersionId, Vec<PointRecord>>,
    shards: BTreeMap<ShardKey, Vec<FeedbackRecord>>,
    options: Vec<FeedbackOption>,
    failures: HashMap<FailPoint, usize>,
    shard_races: usize,
    cutover_before_gc: Option<VersionId>,
    calls: Vec<&'static str>,
}

impl State {
    /// Consume a pending failure for `point`, if any.
    fn take_failure(&mut self, point: FailPoint, op: &str) -> Result<()> {
        match self.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Database(sqlx::Error::Protocol(format!(
                    "injected failure in {}",
                    op
                ))))
            }
            _ => Ok(()),
        }
    }

    fn cutover(&mut self, version: &VersionId) -> Result<CutoverOutcome> {
        if !self.snapshots.contains_key(version) {
            return Err(Error::NotFound(format!(
                "cannot point registry at missing relation {}",
                version.table_name()
            )));
        }
        let outcome = match self.registry.clone() {
            Some(ref c) if c == version => CutoverOutcome::AlreadyCurrent,
            Some(c) if c > *version => CutoverOutcome::SkippedOlder { current: c },
            previous => {
                self.registry = Some(version.clone());
                CutoverOutcome::Advanced { previous }
            }
        };
        Ok(outcome)
    }
}

/// Process-local storage backend.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend with the seeded feedback options.
    pub fn new() -> Self {
        let options = [
            ("IRESxM58KC~dqg5XLCH~n", "自訂"),
            ("ddCp1m88O4g5SU1GDJRPi", "當天已售完"),
            ("nAn6pj8UkrXST1syShrzV", "發放號碼牌"),
            ("uYrYL~7Gd65IN2wWsWa9A", "號碼牌已發送完畢"),
        ]
        .iter()
        .map(|(id, name)| FeedbackOption {
            id: id.to_string(),
            name: name.to_string(),
        })
        .collect();

        Self {
            state: Arc::new(Mutex::new(State {
                options,
                ..Default::default()
            })),
        }
    }

    /// Fail the next `times` calls of `point` with a database error.
    pub fn with_failure(self, point: FailPoint, times: usize) -> Self {
        self.fail_next(point, times);
        self
    }

    pub fn fail_next(&self, point: FailPoint, times: usize) {
        self.lock().failures.insert(point, times);
    }

    /// Make the next `times` shard creations behave as if a concurrent
    /// writer created the shard first.
    pub fn race_next_shard_create(&self, times: usize) {
        self.lock().shard_races = times;
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn snapshot_versions(&self) -> Vec<VersionId> {
        self.lock().snapshots.keys().cloned().collect()
    }

    pub fn snapshot_len(&self, version: &VersionId) -> Option<usize> {
        self.lock().snapshots.get(version).map(Vec::len)
    }

    pub fn staging_count(&self) -> usize {
        self.lock().staging.len()
    }

    /// Leave a half-built staging relation behind, as a build that died
    /// after writing `rows` would.
    pub fn abandon_staging(&self, version: &VersionId, rows: Vec<PointRecord>) {
        self.lock().staging.insert(version.clone(), rows);
    }

    /// Run a cut-over to `version` at the start of the next retention pass,
    /// after the caller decided to collect but before the pass reads the
    /// registry. Models a concurrent commit that took the lock first.
    pub fn cutover_before_next_gc(&self, version: VersionId) {
        self.lock().cutover_before_gc = Some(version);
    }

    pub fn shard_count(&self) -> usize {
        self.lock().shards.len()
    }

    pub fn feedback_len(&self, shard: &ShardKey) -> Option<usize> {
        self.lock().shards.get(shard).map(Vec::len)
    }

    /// Names of backend operations called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and consume a pending failure for `point`, if any.
    fn enter(&self, op: &'static str, point: Option<FailPoint>) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(op);
        if let Some(point) = point {
            state.take_failure(point, op)?;
        }
        Ok(state)
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn registered_version(&self) -> Result<Option<VersionId>> {
        let state = self.enter("registered_version", Some(FailPoint::RegistryRead))?;
        Ok(state.registry.clone())
    }

    async fn snapshot_exists(&self, version: &VersionId) -> Result<bool> {
        let state = self.enter("snapshot_exists", None)?;
        Ok(state.snapshots.contains_key(version))
    }

    async fn materialize(
        &self,
        version: &VersionId,
        batches: &[Vec<PointRecord>],
    ) -> Result<MaterializeOutcome> {
        let mut state = self.enter("materialize", None)?;
        if state.snapshots.contains_key(version) {
            return Ok(MaterializeOutcome::AlreadyPresent);
        }
        state.take_failure(FailPoint::BeginStaging, "materialize")?;

        let mut rows: Vec<PointRecord> = Vec::new();
        for batch in batches {
            state.take_failure(FailPoint::InsertBatch, "materialize")?;
            if let Some(dup) = batch.iter().find(|r| rows.iter().any(|e| e.id == r.id)) {
                return Err(Error::Database(sqlx::Error::Protocol(format!(
                    "duplicate key value violates unique constraint: id={}",
                    dup.id
                ))));
            }
            rows.extend_from_slice(batch);
        }
        state.take_failure(FailPoint::Publish, "materialize")?;

        let records = rows.len() as u64;
        state.staging.remove(version);
        state.snapshots.insert(version.clone(), rows);
        Ok(MaterializeOutcome::Written { records })
    }

    async fn cutover(&self, version: &VersionId) -> Result<CutoverOutcome> {
        let mut state = self.enter("cutover", Some(FailPoint::Cutover))?;
        state.cutover(version)
    }

    async fn list_snapshots(&self) -> Result<Vec<VersionId>> {
        let state = self.enter("list_snapshots", None)?;
        Ok(state.snapshots.keys().cloned().collect())
    }

    async fn drop_retired(&self, keep: usize) -> Result<GcReport> {
        let mut state = self.enter("drop_retired", Some(FailPoint::Gc))?;
        if let Some(version) = state.cutover_before_gc.take() {
            state.cutover(&version)?;
        }

        let current = state.registry.clone();
        let published = state.snapshots.keys().cloned().collect();
        let (kept, retired) = retention_split(published, current.as_ref(), keep);

        let mut report = GcReport {
            kept,
            ..Default::default()
        };
        for version in retired {
            match state.take_failure(FailPoint::DropSnapshot, "drop_retired") {
                Ok(()) => {
                    state.snapshots.remove(&version);
                    report.dropped.push(version);
                }
                Err(e) => report.errors.push(format!("{}: {}", version, e)),
            }
        }
        report.discarded_staging = std::mem::take(&mut state.staging).into_keys().collect();
        Ok(report)
    }

    async fn query_nearby(
        &self,
        version: &VersionId,
        query: &NearbyQuery,
    ) -> Result<Vec<NearbyPoint>> {
        let state = self.enter("query_nearby", Some(FailPoint::Query))?;
        let rows = state.snapshots.get(version).ok_or_else(|| {
            Error::NotFound(format!("relation {} does not exist", version.table_name()))
        })?;

        let mut points: Vec<NearbyPoint> = rows
            .iter()
            .filter(|r| query.bbox.contains(r.coords()))
            .map(|r| NearbyPoint {
                distance: great_circle_miles(query.center, r.coords()),
                record: r.clone(),
            })
            .collect();
        points.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        points.truncate(query.cap());
        Ok(points)
    }
}

#[async_trait]
impl FeedbackBackend for MemoryBackend {
    async fn shard_exists(&self, shard: &ShardKey) -> Result<bool> {
        let state = self.enter("shard_exists", Some(FailPoint::ShardProbe))?;
        Ok(state.shards.contains_key(shard))
    }

    async fn create_shard(&self, shard: &ShardKey) -> Result<()> {
        let mut state = self.enter("create_shard", None)?;
        if state.shard_races > 0 {
            state.shard_races -= 1;
            state.shards.entry(shard.clone()).or_default();
            return Err(Error::ShardCreateRace(shard.table_name()));
        }
        state.shards.entry(shard.clone()).or_default();
        Ok(())
    }

    async fn insert_feedback(&self, shard: &ShardKey, record: &FeedbackRecord) -> Result<()> {
        let mut state = self.enter("insert_feedback", Some(FailPoint::InsertFeedback))?;
        let rows = state.shards.get_mut(shard).ok_or_else(|| {
            Error::NotFound(format!("relation {} does not exist", shard.table_name()))
        })?;
        rows.push(record.clone());
        Ok(())
    }

    async fn select_feedback(
        &self,
        shard: &ShardKey,
        filter: &FeedbackFilter,
        page: PageRequest,
    ) -> Result<Vec<FeedbackRecord>> {
        let state = self.enter("select_feedback", None)?;
        let rows = state.shards.get(shard).ok_or_else(|| {
            Error::NotFound(format!("relation {} does not exist", shard.table_name()))
        })?;

        let mut matching: Vec<FeedbackRecord> =
            rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn count_feedback(&self, shard: &ShardKey, filter: &FeedbackFilter) -> Result<i64> {
        let state = self.enter("count_feedback", None)?;
        let rows = state.shards.get(shard).ok_or_else(|| {
            Error::NotFound(format!("relation {} does not exist", shard.table_name()))
        })?;
        Ok(rows.iter().filter(|r| filter.matches(r)).count() as i64)
    }

    async fn list_options(&self) -> Result<Vec<FeedbackOption>> {
        let state = self.enter("list_options", None)?;
        let mut options = state.options.clone();
        options.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maskmap_core::{BoundingBox, LngLat};

    fn version(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    fn record(id: &str, lng: f64, lat: f64) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            longitude: lng,
            latitude: lat,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failed_build_leaves_nothing() {
        let backend = MemoryBackend::new().with_failure(FailPoint::Publish, 1);
        let v = version("2020_0204_183000");
        let batches = vec![vec![record("a", 121.0, 25.0)]];

        assert!(backend.materialize(&v, &batches).await.is_err());
        assert!(!backend.snapshot_exists(&v).await.unwrap());
        assert_eq!(backend.staging_count(), 0);

        assert_eq!(
            backend.materialize(&v, &batches).await.unwrap(),
            MaterializeOutcome::Written { records: 1 }
        );
        assert_eq!(
            backend.materialize(&v, &batches).await.unwrap(),
            MaterializeOutcome::AlreadyPresent
        );
        assert_eq!(backend.snapshot_len(&v), Some(1));
    }

    #[tokio::test]
    async fn test_cutover_is_monotonic() {
        let backend = MemoryBackend::new();
        let older = version("2020_0204_183000");
        let newer = version("2020_0204_190000");
        for v in [&older, &newer] {
            backend.materialize(v, &[]).await.unwrap();
        }

        assert_eq!(
            backend.cutover(&newer).await.unwrap(),
            CutoverOutcome::Advanced { previous: None }
        );
        assert_eq!(
            backend.cutover(&older).await.unwrap(),
            CutoverOutcome::SkippedOlder {
                current: newer.clone()
            }
        );
        assert_eq!(
            backend.cutover(&newer).await.unwrap(),
            CutoverOutcome::AlreadyCurrent
        );
        assert_eq!(backend.registered_version().await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_drop_retired_rereads_pointer_under_lock() {
        let backend = MemoryBackend::new();
        let v3 = version("2020_0204_030000");
        let v4 = version("2020_0204_040000");
        let v5 = version("2020_0204_050000");
        for v in [&v3, &v4, &v5] {
            backend.materialize(v, &[]).await.unwrap();
        }
        backend.cutover(&v3).await.unwrap();

        // A commit of v4 wins the lock just ahead of the pass.
        backend.cutover_before_next_gc(v4.clone());
        let report = backend.drop_retired(1).await.unwrap();

        assert_eq!(report.kept, vec![v5.clone(), v4.clone()]);
        assert_eq!(report.dropped, vec![v3]);
        assert_eq!(backend.registered_version().await.unwrap(), Some(v4.clone()));
        assert!(backend.snapshot_exists(&v4).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_retired_sweeps_abandoned_staging() {
        let backend = MemoryBackend::new();
        let v = version("2020_0204_183000");
        backend.abandon_staging(&version("2020_0204_170000"), vec![record("a", 0.0, 0.0)]);
        backend.materialize(&v, &[]).await.unwrap();
        backend.cutover(&v).await.unwrap();

        let report = backend.drop_retired(2).await.unwrap();
        assert_eq!(report.discarded_staging, vec![version("2020_0204_170000")]);
        assert_eq!(backend.staging_count(), 0);
        assert_eq!(backend.snapshot_versions(), vec![v]);
    }

    #[tokio::test]
    async fn test_cutover_rejects_missing_relation() {
        let backend = MemoryBackend::new();
        let err = backend
            .cutover(&version("2020_0204_183000"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(backend.registered_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let backend = MemoryBackend::new().with_failure(FailPoint::RegistryRead, 1);
        assert!(backend.registered_version().await.is_err());
        assert!(backend.registered_version().await.is_ok());
    }

    #[tokio::test]
    async fn test_query_nearby_filters_and_orders() {
        let backend = MemoryBackend::new();
        let v = version("2020_0204_183000");
        backend
            .materialize(
                &v,
                &[vec![
                    record("far", 121.6, 25.1),
                    record("near", 121.51, 25.04),
                    record("outside", 120.0, 22.0),
                ]],
            )
            .await
            .unwrap();

        let query = NearbyQuery::new(
            LngLat::new(121.5, 25.04),
            BoundingBox::new(LngLat::new(121.0, 24.5), LngLat::new(122.0, 25.5)),
            10,
        );
        let points = backend.query_nearby(&v, &query).await.unwrap();
        let ids: Vec<_> = points.iter().map(|p| p.record.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!(points[0].distance < points[1].distance);
    }

    #[tokio::test]
    async fn test_duplicate_id_across_batches_is_rejected() {
        let backend = MemoryBackend::new();
        let v = version("2020_0204_183000");
        let batches = vec![vec![record("a", 0.0, 0.0)], vec![record("a", 0.0, 0.0)]];
        assert!(backend.materialize(&v, &batches).await.is_err());
        assert_eq!(backend.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_shard_race_leaves_shard_present() {
        let backend = MemoryBackend::new();
        backend.race_next_shard_create(1);
        let key = ShardKey::parse("2020_0204").unwrap();
        assert!(matches!(
            backend.create_shard(&key).await,
            Err(Error::ShardCreateRace(_))
        ));
        assert!(backend.shard_exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_seeded_options() {
        let options = MemoryBackend::new().list_options().await.unwrap();
        assert_eq!(options.len(), 4);
        assert!(options.iter().any(|o| o.id == "IRESxM58KC~dqg5XLCH~n"));
    }
}
