//! Nearest-records query against the current snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use maskmap_core::defaults;
use maskmap_core::{
    BoundingBox, Error, LngLat, NearbyPoint, NearbyQuery, Result, SnapshotBackend, VersionId,
};

use crate::registry::SnapshotRegistry;

/// Answers "nearest N records inside this box" from the current snapshot.
///
/// Filtering, distance and ordering run in the backend next to the data.
/// A `max` of 0 returns nothing; [`NearbyQuery::UNLIMITED`] returns every
/// record in the box.
pub struct GeoQueryEngine {
    backend: Arc<dyn SnapshotBackend>,
    registry: Arc<SnapshotRegistry>,
    timeout: Duration,
    default_max: u64,
}

impl GeoQueryEngine {
    pub fn new(backend: Arc<dyn SnapshotBackend>, registry: Arc<SnapshotRegistry>) -> Self {
        Self {
            backend,
            registry,
            timeout: Duration::from_secs(defaults::QUERY_TIMEOUT_SECS),
            default_max: defaults::QUERY_MAX,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_max(mut self, max: u64) -> Self {
        self.default_max = max;
        self
    }

    /// Records inside `bbox`, nearest to `center` first, at most `max`.
    pub async fn query(
        &self,
        center: LngLat,
        bbox: BoundingBox,
        max: u64,
    ) -> Result<Vec<NearbyPoint>> {
        self.run(&NearbyQuery::new(center, bbox, max)).await
    }

    /// Same as [`query`](Self::query) with the configured default cap.
    pub async fn query_default(&self, center: LngLat, bbox: BoundingBox) -> Result<Vec<NearbyPoint>> {
        self.query(center, bbox, self.default_max).await
    }

    /// Execute a prepared query under the configured deadline.
    pub async fn run(&self, query: &NearbyQuery) -> Result<Vec<NearbyPoint>> {
        query.validate()?;
        if query.max == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let points = tokio::time::timeout(self.timeout, self.execute(query))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "nearby query exceeded {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        debug!(
            subsystem = "query",
            op = "nearby",
            result_count = points.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Nearby query complete"
        );
        Ok(points)
    }

    async fn execute(&self, query: &NearbyQuery) -> Result<Vec<NearbyPoint>> {
        let version = self.resolve().await?;

        match self.backend.query_nearby(&version, query).await {
            Ok(points) => Ok(points),
            Err(Error::NotFound(_)) => {
                // Dropped under us (another process's GC); re-resolve once.
                warn!(
                    subsystem = "query",
                    op = "nearby",
                    version = %version,
                    "Resolved snapshot is gone, re-resolving"
                );
                self.registry.invalidate().await;
                let fresh = self.registry.refresh().await?;
                if fresh == version {
                    return Err(Error::query(Error::NotFound(format!(
                        "current snapshot {} has no relation",
                        version
                    ))));
                }
                self.backend
                    .query_nearby(&fresh, query)
                    .await
                    .map_err(Error::query)
            }
            Err(e) => Err(Error::query(e)),
        }
    }

    async fn resolve(&self) -> Result<VersionId> {
        match self.registry.resolve_current().await {
            Err(Error::NotFound(_)) => {
                debug!(
                    subsystem = "query",
                    op = "resolve",
                    "No current snapshot cached, re-resolving once"
                );
                self.registry.invalidate().await;
                self.registry.refresh().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailPoint, MemoryBackend};
    use maskmap_core::PointRecord;

    fn record(id: &str, lng: f64, lat: f64) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            longitude: lng,
            latitude: lat,
            ..Default::default()
        }
    }

    async fn seeded() -> (MemoryBackend, GeoQueryEngine) {
        let backend = MemoryBackend::new();
        let v = VersionId::parse("2020_0204_183000").unwrap();
        backend
            .materialize(
                &v,
                &[vec![
                    record("a", 121.50, 25.03),
                    record("b", 121.52, 25.05),
                    record("c", 121.60, 25.10),
                ]],
            )
            .await
            .unwrap();
        backend.cutover(&v).await.unwrap();

        let shared: Arc<dyn SnapshotBackend> = Arc::new(backend.clone());
        let registry = Arc::new(SnapshotRegistry::new(shared.clone()));
        (backend, GeoQueryEngine::new(shared, registry))
    }

    #[tokio::test]
    async fn test_zero_max_returns_nothing() {
        let (backend, engine) = seeded().await;
        let points = engine
            .query(LngLat::new(121.5, 25.0), BoundingBox::world(), 0)
            .await
            .unwrap();
        assert!(points.is_empty());
        assert_eq!(backend.call_count("query_nearby"), 0);
    }

    #[tokio::test]
    async fn test_unlimited_returns_every_match() {
        let (_, engine) = seeded().await;
        let points = engine
            .query(
                LngLat::new(121.5, 25.0),
                BoundingBox::world(),
                NearbyQuery::UNLIMITED,
            )
            .await
            .unwrap();
        assert_eq!(points.len(), 3);
    }

    #[tokio::test]
    async fn test_truncates_to_max() {
        let (_, engine) = seeded().await;
        let points = engine
            .query(LngLat::new(121.60, 25.10), BoundingBox::world(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = points.iter().map(|p| p.record.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_inverted_box_is_malformed() {
        let (_, engine) = seeded().await;
        let bbox = BoundingBox::new(LngLat::new(122.0, 25.5), LngLat::new(121.0, 24.5));
        let err = engine
            .query(LngLat::new(121.5, 25.0), bbox, 10)
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_storage_error_is_query_execution_failed() {
        let (backend, engine) = seeded().await;
        backend.fail_next(FailPoint::Query, 1);
        let err = engine
            .query(LngLat::new(121.5, 25.0), BoundingBox::world(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_registry_failure_propagates() {
        let (backend, engine) = seeded().await;
        backend.fail_next(FailPoint::RegistryRead, 1);
        let err = engine
            .query(LngLat::new(121.5, 25.0), BoundingBox::world(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_nothing_committed_is_not_found() {
        let backend: Arc<dyn SnapshotBackend> = Arc::new(MemoryBackend::new());
        let registry = Arc::new(SnapshotRegistry::new(backend.clone()));
        let engine = GeoQueryEngine::new(backend, registry);
        let err = engine
            .query(LngLat::new(121.5, 25.0), BoundingBox::world(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
