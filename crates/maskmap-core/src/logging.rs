//! Structured logging field names shared by every maskmap crate.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, ingestion and cut-over completions |
//! | DEBUG | Decision points, cache hits/misses, skipped work |
//! | TRACE | Per-batch and per-row detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "database", "registry", "writer", "query", "feedback", "ingest",
/// "sync", "config"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "schema", "writer" (within "database")
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "resolve", "commit", "cutover", "gc", "append", "query"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Snapshot version identifier.
pub const VERSION: &str = "version";

/// Feedback shard key.
pub const SHARD: &str = "shard";

/// Database table or relation affected.
pub const DB_TABLE: &str = "db_table";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows returned by a query.
pub const RESULT_COUNT: &str = "result_count";

/// Number of records written.
pub const RECORD_COUNT: &str = "record_count";

/// Number of insert batches.
pub const BATCH_COUNT: &str = "batch_count";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Every field name above. Log call sites use these names verbatim.
pub const FIELDS: &[&str] = &[
    SUBSYSTEM,
    COMPONENT,
    OPERATION,
    VERSION,
    SHARD,
    DB_TABLE,
    DURATION_MS,
    RESULT_COUNT,
    RECORD_COUNT,
    BATCH_COUNT,
    POOL_SIZE,
    POOL_IDLE,
    ERROR_MSG,
];
