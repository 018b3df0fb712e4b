//! Keeps the pharmacy snapshot current.
//!
//! Connects to `DATABASE_URL`, then ingests `MASKMAP_FEED_SOURCE` every
//! `MASKMAP_SYNC_INTERVAL_SECS` until interrupted, or once when
//! `MASKMAP_SYNC_ONCE` is set.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maskmap_core::StoreConfig;
use maskmap_db::{log_pool_metrics, Database};
use maskmap_ingest::{IngestPipeline, SyncScheduler};

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "maskmap_sync=info,maskmap_db=info,maskmap_ingest=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("maskmap-sync.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _file_guard = init_tracing();

    let config = StoreConfig::from_env().context("invalid configuration")?;
    info!(
        retention = config.retention,
        batch_size = config.batch_size,
        timezone = %config.timezone,
        feed_source = %config.feed_source,
        sync_once = config.sync_once,
        "Starting maskmap-sync"
    );

    let db = Database::connect(&config)
        .await
        .context("failed to connect to database")?;
    if let Some(pool) = db.pool() {
        log_pool_metrics(pool);
    }
    let db = Arc::new(db);

    let pipeline = Arc::new(
        IngestPipeline::from_config(db.clone(), &config).context("invalid feed source")?,
    );
    let scheduler = SyncScheduler::new(pipeline, config.sync_interval);

    if config.sync_once {
        let report = scheduler.run_once().await.context("sync failed")?;
        info!(
            version = %report.version,
            materialized = report.materialized,
            records = report.records,
            cutover = ?report.cutover,
            dropped = report.gc.dropped.len(),
            "Single sync complete"
        );
        return Ok(());
    }

    let handle = scheduler.start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    handle.shutdown().await.context("scheduler shutdown failed")?;
    Ok(())
}
