//! Periodic sync trigger.
//!
//! Runs the pipeline immediately and then every interval until shut down.
//! A failed run is logged and retried on the next tick; retries are safe
//! because commits are idempotent per version.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use maskmap_core::{CommitReport, Error, Result, VersionId};

use crate::pipeline::IngestPipeline;

const EVENT_BUS_CAPACITY: usize = 16;

/// Event emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Completed {
        version: VersionId,
        materialized: bool,
    },
    Failed {
        error: String,
    },
    Stopped,
}

/// Handle for controlling a running scheduler.
pub struct SyncHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal the scheduler to stop and wait for the in-flight run to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("sync task failed: {}", e)))
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_rx.resubscribe()
    }
}

/// Drives [`IngestPipeline::sync`] on a fixed interval.
pub struct SyncScheduler {
    pipeline: Arc<IngestPipeline>,
    interval: Duration,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncScheduler {
    pub fn new(pipeline: Arc<IngestPipeline>, interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            pipeline,
            interval,
            event_tx,
        }
    }

    /// Receive events from this scheduler, including those of the first run.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Run a single sync and report the result.
    pub async fn run_once(&self) -> Result<CommitReport> {
        let result = self.pipeline.sync().await;
        let event = match &result {
            Ok(report) => SyncEvent::Completed {
                version: report.version.clone(),
                materialized: report.materialized,
            },
            Err(e) => SyncEvent::Failed {
                error: e.to_string(),
            },
        };
        let _ = self.event_tx.send(event);
        result
    }

    /// Start the loop and return a handle for control.
    pub fn start(self) -> SyncHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        SyncHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            subsystem = "sync",
            interval_secs = self.interval.as_secs(),
            source = %self.pipeline.source(),
            "Sync scheduler started"
        );
        let _ = self.event_tx.send(SyncEvent::Started);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "sync", "Sync scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(
                            subsystem = "sync",
                            error = %e,
                            retryable = e.is_retryable(),
                            "Scheduled sync failed, retrying next tick"
                        );
                    }
                }
            }
        }

        let _ = self.event_tx.send(SyncEvent::Stopped);
        info!(subsystem = "sync", "Sync scheduler stopped");
    }
}
