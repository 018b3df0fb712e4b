//! Feed-to-query runs over a file source and the in-memory backend.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;

use maskmap_core::{BoundingBox, CutoverOutcome, Error, StoreConfig};
use maskmap_db::{Database, MemoryBackend};
use maskmap_ingest::{FeedSource, IngestPipeline, SyncEvent, SyncScheduler};

fn feed(updated: &str) -> String {
    let features: Vec<_> = [
        ("5901012345", 121.5645, 25.0330),
        ("5901023456", 121.5436, 25.0268),
        ("5901034567", 121.5229, 25.0522),
    ]
    .iter()
    .map(|(id, lng, lat)| {
        json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [lng, lat] },
            "properties": {
                "id": id,
                "name": format!("藥局 {}", id),
                "mask_adult": 100,
                "mask_child": 20,
                "updated": updated
            }
        })
    })
    .collect();
    json!({ "type": "FeatureCollection", "features": features }).to_string()
}

fn write_feed(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp feed");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp feed");
    file
}

fn setup(file: &NamedTempFile) -> (MemoryBackend, Arc<Database>, IngestPipeline) {
    let backend = MemoryBackend::new();
    let config = StoreConfig::default().with_batch_size(2);
    let db = Arc::new(Database::in_memory(backend.clone(), &config));
    let pipeline = IngestPipeline::new(
        db.clone(),
        FeedSource::File(file.path().to_path_buf()),
        &config,
    );
    (backend, db, pipeline)
}

#[tokio::test]
async fn test_sync_then_query_nearest_first() {
    let file = write_feed(&feed("2020/02/04 18:30:00"));
    let (_, db, pipeline) = setup(&file);

    let report = pipeline.sync().await.expect("sync should succeed");
    assert_eq!(report.version.as_str(), "2020_0204_183000");
    assert_eq!(report.records, 3);

    let ingested = pipeline.ingest().await.unwrap();
    let center = ingested.batches[0][1].coords();
    let points = db
        .nearby
        .query(center, BoundingBox::world(), 10)
        .await
        .unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0].record.id, "5901023456");
    assert_eq!(points[0].distance, 0.0);
}

#[tokio::test]
async fn test_repeated_sync_of_same_feed_is_idempotent() {
    let file = write_feed(&feed("2020/02/04 18:30:00"));
    let (backend, db, pipeline) = setup(&file);

    pipeline.sync().await.unwrap();
    let before = db.registry.resolve_current().await.unwrap();
    let second = pipeline.sync().await.expect("duplicate sync should succeed");
    let after = db.registry.resolve_current().await.unwrap();

    assert!(!second.materialized);
    assert_eq!(second.cutover, CutoverOutcome::AlreadyCurrent);
    assert_eq!(before, after);
    assert_eq!(backend.snapshot_count(), 1);
}

#[tokio::test]
async fn test_feed_without_timestamps_is_rejected() {
    let file = write_feed(&feed(""));
    let (backend, db, pipeline) = setup(&file);

    let err = pipeline.sync().await.unwrap_err();
    assert!(matches!(err, Error::NoVersionTimestamp));
    assert_eq!(backend.snapshot_count(), 0);
    assert!(db.registry.resolve_current().await.is_err());
}

#[tokio::test]
async fn test_bad_timestamp_keeps_previous_snapshot_current() {
    let file = write_feed(&feed("2020/02/04 18:30:00"));
    let (_, db, pipeline) = setup(&file);
    pipeline.sync().await.unwrap();

    let bad = write_feed(&feed("04-02-2020 19:00"));
    let config = StoreConfig::default();
    let bad_pipeline = IngestPipeline::new(
        db.clone(),
        FeedSource::File(bad.path().to_path_buf()),
        &config,
    );
    let err = bad_pipeline.sync().await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(
        db.registry.resolve_current().await.unwrap().as_str(),
        "2020_0204_183000"
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_is_timeout() {
    // Accepts connections into the backlog and never answers.
    let silent = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let url = format!(
        "http://{}/points.json",
        silent.local_addr().expect("Listener has no address")
    );

    let backend = MemoryBackend::new();
    let config = StoreConfig::default();
    let db = Arc::new(Database::in_memory(backend.clone(), &config));
    let pipeline = IngestPipeline::new(db, FeedSource::Url(url), &config)
        .with_timeout(Duration::from_secs(5));

    let err = pipeline.sync().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
    assert_eq!(backend.snapshot_count(), 0);
    assert_eq!(backend.call_count("materialize"), 0);
    drop(silent);
}

#[tokio::test]
async fn test_scheduler_runs_and_shuts_down() {
    let file = write_feed(&feed("2020/02/04 18:30:00"));
    let (_, db, pipeline) = setup(&file);

    let scheduler = SyncScheduler::new(Arc::new(pipeline), Duration::from_secs(3600));
    let mut events = scheduler.subscribe();
    let handle = scheduler.start();

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Completed { version, .. }) => return Some(version),
                Ok(SyncEvent::Failed { .. }) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    })
    .await
    .expect("scheduler did not run in time");

    assert_eq!(
        completed.map(|v| v.as_str().to_string()),
        Some("2020_0204_183000".to_string())
    );
    handle.shutdown().await.expect("shutdown should succeed");
    assert!(db.registry.resolve_current().await.is_ok());
}
