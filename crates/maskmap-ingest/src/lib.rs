//! # maskmap-ingest
//!
//! Pulls the pharmacy feed, turns it into a versioned snapshot and keeps it
//! current on an interval.

pub mod feed;
pub mod pipeline;
pub mod scheduler;
pub mod source;

pub use feed::{parse_feed, parse_updated, ParsedFeed};
pub use pipeline::{ingest, IngestPipeline, Ingested};
pub use scheduler::{SyncEvent, SyncHandle, SyncScheduler};
pub use source::FeedSource;
