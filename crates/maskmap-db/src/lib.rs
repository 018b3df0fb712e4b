//! # maskmap-db
//!
//! Storage layer for the maskmap directory.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL and in-memory backends
//! - The snapshot registry, writer and retention GC
//! - Nearest-records queries computed next to the data
//! - The day-sharded feedback log
//!
//! ## Example
//!
//! ```rust,ignore
//! use maskmap_db::{Database, StoreConfig, LngLat, BoundingBox};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect(&StoreConfig::from_env()?).await?;
//!     let nearest = db
//!         .nearby
//!         .query(LngLat::new(121.56, 25.03), BoundingBox::world(), 10)
//!         .await?;
//!     println!("{} pharmacies", nearest.len());
//!     Ok(())
//! }
//! ```

pub mod feedback;
pub mod memory;
pub mod nearby;
pub mod pool;
pub mod postgres;
pub mod registry;
pub mod relation_validation;
pub mod writer;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use them
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use maskmap_core::*;

pub use feedback::{Clock, FeedbackStore};
pub use memory::{FailPoint, MemoryBackend};
pub use nearby::GeoQueryEngine;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use postgres::PgBackend;
pub use registry::SnapshotRegistry;
pub use relation_validation::{shard_table, snapshot_table, staging_table, validate_relation_name};
pub use writer::SnapshotWriter;

/// Combined store context wiring every component to one backend.
pub struct Database {
    /// Underlying pool when backed by PostgreSQL.
    pool: Option<sqlx::PgPool>,
    /// Current-snapshot pointer shared by writer and query engine.
    pub registry: Arc<SnapshotRegistry>,
    /// Snapshot materialization, cut-over and retention.
    pub writer: SnapshotWriter,
    /// Nearest-records queries.
    pub nearby: GeoQueryEngine,
    /// Day-sharded feedback log.
    pub feedback: FeedbackStore,
}

impl Database {
    /// Wire the components over arbitrary backends.
    pub fn with_backends(
        snapshots: Arc<dyn SnapshotBackend>,
        feedback: Arc<dyn FeedbackBackend>,
        config: &StoreConfig,
    ) -> Self {
        let registry = Arc::new(SnapshotRegistry::new(snapshots.clone()));
        Self {
            pool: None,
            writer: SnapshotWriter::new(snapshots.clone(), registry.clone())
                .with_retention(config.retention),
            nearby: GeoQueryEngine::new(snapshots, registry.clone())
                .with_timeout(config.query_timeout)
                .with_default_max(config.default_max),
            feedback: FeedbackStore::new(feedback, config.timezone),
            registry,
        }
    }

    /// Wire the components over one PostgreSQL backend.
    pub fn from_pg(backend: PgBackend, config: &StoreConfig) -> Self {
        let pool = backend.pool().clone();
        let backend = Arc::new(backend);
        let mut db = Self::with_backends(backend.clone(), backend, config);
        db.pool = Some(pool);
        db
    }

    /// Wire the components over one in-memory backend.
    pub fn in_memory(backend: MemoryBackend, config: &StoreConfig) -> Self {
        let backend = Arc::new(backend);
        Self::with_backends(backend.clone(), backend, config)
    }

    /// Connect to `config.database_url` and ensure the fixed schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Self::connect_with_config(config, PoolConfig::from_env()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(config: &StoreConfig, pool_config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(&config.database_url, pool_config).await?;
        let backend = PgBackend::new(pool);
        backend.ensure_schema().await?;
        Ok(Self::from_pg(backend, config))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::Config("migrations need a PostgreSQL backend".to_string()))?;
        sqlx::migrate!("../../migrations")
            .run(pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool, if any.
    pub fn pool(&self) -> Option<&sqlx::PgPool> {
        self.pool.as_ref()
    }
}
