//! Centralized default constants for maskmap.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and the sync binary reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Number of snapshot relations kept by retention GC.
pub const RETENTION: usize = 5;

/// Records per insert batch during materialization.
pub const BATCH_SIZE: usize = 500;

/// Key of the single `pg_advisory_xact_lock` serializing cut-overs.
pub const CUTOVER_LOCK_KEY: i64 = 0x6d61_736b_6d61_70;

/// First key of the two-key `pg_advisory_xact_lock` taken per version while
/// a snapshot is built. The second key is the hash of the relation name.
pub const MATERIALIZE_LOCK_CLASS: i32 = 0x6d6d_6170;

/// Name of the registry row that points at the current snapshot.
pub const REGISTRY_DATASET: &str = "pharmacy";

// =============================================================================
// QUERIES
// =============================================================================

/// Default result cap for nearby queries.
pub const QUERY_MAX: u64 = 100;

/// Deadline for one nearby query, in seconds.
pub const QUERY_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// INGESTION
// =============================================================================

/// Where the mask-stock feed is published.
pub const FEED_SOURCE: &str = "https://raw.githubusercontent.com/kiang/pharmacies/master/json/points.json";

/// `updated` timestamp format used by the feed.
pub const FEED_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// IANA zone for feed timestamps and shard keys.
pub const TIMEZONE: &str = "Asia/Taipei";

/// Deadline for fetching the feed and committing it, in seconds.
pub const INGEST_TIMEOUT_SECS: u64 = 50;

/// Interval of the periodic sync trigger, in seconds.
pub const SYNC_INTERVAL_SECS: u64 = 300;

// =============================================================================
// FEEDBACK
// =============================================================================

/// Option id whose feedback must carry a free-text description.
pub const CUSTOM_OPTION_ID: &str = "IRESxM58KC~dqg5XLCH~n";

/// Length of generated feedback ids.
pub const ID_LENGTH: usize = 21;

/// Default page size for feedback listings.
pub const PAGE_LIMIT: i64 = 10;

/// Largest accepted page size for feedback listings.
pub const PAGE_LIMIT_MAX: i64 = 100;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;

// =============================================================================
// DATABASE
// =============================================================================

/// Database URL used when `DATABASE_URL` is unset.
pub const DATABASE_URL: &str = "postgres://localhost/maskmap";
