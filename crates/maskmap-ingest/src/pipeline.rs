//! Fetch, parse, batch and commit one feed revision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use tracing::{info, warn};

use maskmap_core::{partition, CommitReport, Error, PointRecord, Result, StoreConfig, VersionId};
use maskmap_db::Database;

use crate::feed::parse_feed;
use crate::source::FeedSource;

/// A parsed feed split into insert batches.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub version: VersionId,
    pub record_count: usize,
    pub batches: Vec<Vec<PointRecord>>,
}

/// Parse `document` and partition its records into batches of `batch_size`.
pub fn ingest(document: &str, tz: &Tz, batch_size: usize) -> Result<Ingested> {
    let parsed = parse_feed(document, tz)?;
    let record_count = parsed.record_count();
    Ok(Ingested {
        version: parsed.version,
        record_count,
        batches: partition(parsed.records, batch_size),
    })
}

/// Pulls the feed and hands it to the snapshot writer under a deadline.
pub struct IngestPipeline {
    db: Arc<Database>,
    source: FeedSource,
    client: reqwest::Client,
    timezone: Tz,
    batch_size: usize,
    timeout: Duration,
}

impl IngestPipeline {
    pub fn new(db: Arc<Database>, source: FeedSource, config: &StoreConfig) -> Self {
        Self {
            db,
            source,
            client: reqwest::Client::new(),
            timezone: config.timezone,
            batch_size: config.batch_size,
            timeout: config.ingest_timeout,
        }
    }

    /// Build from configuration, parsing `config.feed_source`.
    pub fn from_config(db: Arc<Database>, config: &StoreConfig) -> Result<Self> {
        let source = FeedSource::parse(&config.feed_source)?;
        Ok(Self::new(db, source, config))
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Fetch and parse the feed without writing anything.
    pub async fn ingest(&self) -> Result<Ingested> {
        let document = self.source.fetch(&self.client).await?;
        ingest(&document, &self.timezone, self.batch_size)
    }

    /// Fetch, parse and commit. Safe to repeat for the same feed revision.
    pub async fn sync(&self) -> Result<CommitReport> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, async {
            let ingested = self.ingest().await?;
            info!(
                subsystem = "ingest",
                op = "parse",
                version = %ingested.version,
                record_count = ingested.record_count,
                batch_count = ingested.batches.len(),
                "Feed parsed"
            );
            self.db
                .writer
                .commit(&ingested.version, ingested.batches)
                .await
        })
        .await;

        match result {
            Ok(Ok(report)) => {
                info!(
                    subsystem = "ingest",
                    op = "sync",
                    version = %report.version,
                    materialized = report.materialized,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Sync complete"
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                warn!(
                    subsystem = "ingest",
                    op = "sync",
                    source = %self.source,
                    error = %e,
                    "Sync failed"
                );
                Err(e)
            }
            Err(_) => {
                warn!(
                    subsystem = "ingest",
                    op = "sync",
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Sync exceeded deadline"
                );
                Err(Error::Timeout(format!(
                    "ingestion exceeded {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
