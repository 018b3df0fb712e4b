//! Snapshot materialization, cut-over and retention GC.
//!
//! `commit` is the only path by which a snapshot becomes current:
//!
//! 1. build the relation under its staging name and publish it with one
//!    rename, as a single backend unit of work; a version that is already
//!    published is left as it is
//! 2. cut over under the backend's global lock, never moving backwards
//! 3. update the registry cache
//! 4. under the same lock, drop snapshots beyond the retention window (never
//!    the current one) and staging left by abandoned builds
//!
//! Steps 1 and 2 fail with `MaterializeFailed` / `CutoverFailed`; the whole
//! call is safe to retry. GC failures are reported and logged only.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use maskmap_core::defaults;
use maskmap_core::{
    CommitReport, CutoverOutcome, Error, GcReport, MaterializeOutcome, PointRecord, Result,
    SnapshotBackend, VersionId,
};

use crate::registry::SnapshotRegistry;

/// Writes snapshots and moves the current pointer.
pub struct SnapshotWriter {
    backend: Arc<dyn SnapshotBackend>,
    registry: Arc<SnapshotRegistry>,
    retention: usize,
}

impl SnapshotWriter {
    pub fn new(backend: Arc<dyn SnapshotBackend>, registry: Arc<SnapshotRegistry>) -> Self {
        Self {
            backend,
            registry,
            retention: defaults::RETENTION,
        }
    }

    /// Number of snapshots kept by GC (at least 1).
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Materialize `version` from `batches` and make it current.
    pub async fn commit(
        &self,
        version: &VersionId,
        batches: Vec<Vec<PointRecord>>,
    ) -> Result<CommitReport> {
        let start = Instant::now();

        let (materialized, records) = match self.materialize(version, &batches).await? {
            MaterializeOutcome::Written { records } => (true, records),
            MaterializeOutcome::AlreadyPresent => {
                info!(
                    subsystem = "writer",
                    op = "commit",
                    version = %version,
                    "Snapshot already materialized, skipping rewrite"
                );
                (false, 0)
            }
        };

        let cutover = self
            .backend
            .cutover(version)
            .await
            .map_err(|e| Error::cutover(version, e))?;

        match &cutover {
            CutoverOutcome::Advanced { previous } => {
                info!(
                    subsystem = "writer",
                    op = "cutover",
                    version = %version,
                    previous = previous.as_ref().map(VersionId::as_str).unwrap_or("none"),
                    "Current snapshot advanced"
                );
                self.registry.set_current(version.clone()).await;
            }
            CutoverOutcome::AlreadyCurrent => {
                debug!(
                    subsystem = "writer",
                    op = "cutover",
                    version = %version,
                    "Snapshot already current"
                );
                self.registry.set_current(version.clone()).await;
            }
            CutoverOutcome::SkippedOlder { current } => {
                warn!(
                    subsystem = "writer",
                    op = "cutover",
                    version = %version,
                    current = %current,
                    "Newer snapshot is current, pointer left in place"
                );
                self.registry.invalidate().await;
            }
        }

        let gc = self.gc().await;

        info!(
            subsystem = "writer",
            op = "commit",
            version = %version,
            materialized,
            record_count = records,
            dropped = gc.dropped.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Commit complete"
        );

        Ok(CommitReport {
            version: version.clone(),
            materialized,
            records,
            cutover,
            gc,
        })
    }

    async fn materialize(
        &self,
        version: &VersionId,
        batches: &[Vec<PointRecord>],
    ) -> Result<MaterializeOutcome> {
        let start = Instant::now();
        match self.backend.materialize(version, batches).await {
            Ok(outcome) => {
                if let MaterializeOutcome::Written { records } = outcome {
                    info!(
                        subsystem = "writer",
                        op = "materialize",
                        version = %version,
                        record_count = records,
                        batch_count = batches.len(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Snapshot materialized"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    subsystem = "writer",
                    op = "materialize",
                    version = %version,
                    error = %e,
                    "Materialization failed, build rolled back"
                );
                Err(Error::materialize(version, e))
            }
        }
    }

    /// Drop snapshots outside the retention window.
    ///
    /// The backend re-reads the registry under the cut-over lock, so the
    /// current version is kept even when another process cuts over while
    /// this pass runs. Best-effort: failures land in the report.
    pub async fn gc(&self) -> GcReport {
        let report = match self.backend.drop_retired(self.retention).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    subsystem = "writer",
                    op = "gc",
                    error = %e,
                    "Retention pass could not run"
                );
                return GcReport {
                    errors: vec![format!("retention pass failed: {}", e)],
                    ..Default::default()
                };
            }
        };

        for version in &report.dropped {
            debug!(
                subsystem = "writer",
                op = "gc",
                version = %version,
                "Dropped retired snapshot"
            );
        }
        for error in &report.errors {
            warn!(
                subsystem = "writer",
                op = "gc",
                error = %error,
                "Failed to drop retired relation"
            );
        }
        if !report.dropped.is_empty() || !report.discarded_staging.is_empty() {
            info!(
                subsystem = "writer",
                op = "gc",
                kept = report.kept.len(),
                dropped = report.dropped.len(),
                discarded_staging = report.discarded_staging.len(),
                "Retention pass complete"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailPoint, MemoryBackend};

    fn version(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    fn batch(ids: &[&str]) -> Vec<Vec<PointRecord>> {
        vec![ids
            .iter()
            .map(|id| PointRecord {
                id: id.to_string(),
                ..Default::default()
            })
            .collect()]
    }

    fn writer(backend: &MemoryBackend, retention: usize) -> (SnapshotWriter, Arc<SnapshotRegistry>) {
        let backend: Arc<dyn SnapshotBackend> = Arc::new(backend.clone());
        let registry = Arc::new(SnapshotRegistry::new(backend.clone()));
        (
            SnapshotWriter::new(backend, registry.clone()).with_retention(retention),
            registry,
        )
    }

    #[tokio::test]
    async fn test_commit_materializes_and_advances() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 5);
        let v = version("2020_0204_183000");

        let report = writer.commit(&v, batch(&["a", "b"])).await.unwrap();
        assert!(report.materialized);
        assert_eq!(report.records, 2);
        assert_eq!(report.cutover, CutoverOutcome::Advanced { previous: None });
        assert_eq!(registry.cached().await, Some(v.clone()));
        assert_eq!(backend.snapshot_len(&v), Some(2));
    }

    #[tokio::test]
    async fn test_insert_failure_leaves_current_untouched() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 5);
        let good = version("2020_0204_183000");
        let bad = version("2020_0204_190000");
        writer.commit(&good, batch(&["a"])).await.unwrap();

        backend.fail_next(FailPoint::InsertBatch, 1);
        let err = writer.commit(&bad, batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, Error::MaterializeFailed { .. }));
        assert!(err.is_retryable());

        assert_eq!(registry.resolve_current().await.unwrap(), good);
        assert_eq!(backend.snapshot_versions(), vec![good]);
        assert_eq!(backend.staging_count(), 0);
    }

    #[tokio::test]
    async fn test_cutover_failure_is_typed_and_retry_converges() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 5);
        let v = version("2020_0204_183000");

        backend.fail_next(FailPoint::Cutover, 1);
        let err = writer.commit(&v, batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, Error::CutoverFailed { .. }));

        // Relation was published but is not current; the retry only cuts over.
        let report = writer.commit(&v, batch(&["a"])).await.unwrap();
        assert!(!report.materialized);
        assert_eq!(report.cutover, CutoverOutcome::Advanced { previous: None });
        assert_eq!(registry.resolve_current().await.unwrap(), v);
    }

    #[tokio::test]
    async fn test_older_commit_does_not_regress_pointer() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 5);
        let newer = version("2020_0204_190000");
        let older = version("2020_0204_183000");

        writer.commit(&newer, batch(&["a"])).await.unwrap();
        let report = writer.commit(&older, batch(&["a"])).await.unwrap();
        assert_eq!(
            report.cutover,
            CutoverOutcome::SkippedOlder {
                current: newer.clone()
            }
        );
        // Kept for audit.
        assert_eq!(backend.snapshot_count(), 2);
        assert_eq!(registry.resolve_current().await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_gc_keeps_k_newest() {
        let backend = MemoryBackend::new();
        let (writer, _) = writer(&backend, 2);
        for hh in 10..14 {
            let v = version(&format!("2020_0204_{}0000", hh));
            writer.commit(&v, batch(&["a"])).await.unwrap();
        }
        assert_eq!(
            backend.snapshot_versions(),
            vec![version("2020_0204_120000"), version("2020_0204_130000")]
        );
    }

    #[tokio::test]
    async fn test_gc_never_drops_current() {
        let backend = MemoryBackend::new();
        let (writer, _) = writer(&backend, 1);
        let current = version("2020_0204_120000");
        writer.commit(&current, batch(&["a"])).await.unwrap();

        // Newer relations published without a cut-over.
        for v in ["2020_0204_130000", "2020_0204_140000"] {
            backend.materialize(&version(v), &[]).await.unwrap();
        }

        let report = writer.gc().await;
        assert!(report.kept.contains(&current));
        assert_eq!(report.dropped, vec![version("2020_0204_130000")]);
    }

    #[tokio::test]
    async fn test_gc_drop_failure_is_not_fatal() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 1);
        writer
            .commit(&version("2020_0204_120000"), batch(&["a"]))
            .await
            .unwrap();

        backend.fail_next(FailPoint::DropSnapshot, 1);
        let v = version("2020_0204_130000");
        let report = writer.commit(&v, batch(&["a"])).await.unwrap();
        assert!(report.gc.has_errors());
        assert!(report.gc.dropped.is_empty());
        assert_eq!(registry.resolve_current().await.unwrap(), v);

        // Picked up on the next pass.
        let report = writer.gc().await;
        assert_eq!(report.dropped, vec![version("2020_0204_120000")]);
    }

    #[tokio::test]
    async fn test_gc_keeps_version_cut_over_during_the_pass() {
        let backend = MemoryBackend::new();
        let (writer, _) = writer(&backend, 1);
        let v3 = version("2020_0204_030000");
        let v4 = version("2020_0204_040000");
        let v5 = version("2020_0204_050000");
        writer.commit(&v3, batch(&["a"])).await.unwrap();
        backend.materialize(&v5, &batch(&["a"])).await.unwrap();
        backend.materialize(&v4, &batch(&["a"])).await.unwrap();

        // Ranked beyond the window, but current by the time the drops run.
        backend.cutover_before_next_gc(v4.clone());
        let report = writer.gc().await;

        assert!(!report.has_errors());
        assert_eq!(report.dropped, vec![v3]);
        assert_eq!(backend.snapshot_versions(), vec![v4.clone(), v5]);
        assert_eq!(backend.registered_version().await.unwrap(), Some(v4));
    }

    #[tokio::test]
    async fn test_abandoned_staging_is_collected() {
        let backend = MemoryBackend::new();
        let (writer, _) = writer(&backend, 2);
        backend.abandon_staging(&version("2020_0204_170000"), batch(&["a"]).remove(0));

        for hh in 18..23 {
            let v = version(&format!("2020_0204_{}0000", hh));
            writer.commit(&v, batch(&["a"])).await.unwrap();
        }
        assert_eq!(backend.staging_count(), 0);
        assert_eq!(backend.snapshot_count(), 2);
    }

    #[tokio::test]
    async fn test_retention_pass_failure_is_reported() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 1);
        let v = version("2020_0204_120000");

        backend.fail_next(FailPoint::Gc, 1);
        let report = writer.commit(&v, batch(&["a"])).await.unwrap();
        assert!(report.gc.has_errors());
        assert!(report.gc.kept.is_empty());
        assert_eq!(registry.resolve_current().await.unwrap(), v);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_commits_converge() {
        let backend = MemoryBackend::new();
        let (writer, registry) = writer(&backend, 2);
        let v = version("2020_0204_183000");

        let (a, b, c, d) = tokio::join!(
            writer.commit(&v, batch(&["a", "b"])),
            writer.commit(&v, batch(&["a", "b"])),
            writer.commit(&v, batch(&["a", "b"])),
            writer.commit(&v, batch(&["a", "b"])),
        );
        let reports = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];

        assert_eq!(reports.iter().filter(|r| r.materialized).count(), 1);
        assert_eq!(backend.call_count("materialize"), 4);
        assert_eq!(backend.snapshot_len(&v), Some(2));
        assert_eq!(registry.resolve_current().await.unwrap(), v);
    }
}
