//! Connection pool for the PostgreSQL backend.
//!
//! The sync process holds at most a few connections at once: one for a
//! staging insert or cut-over transaction, one for registry reads and one
//! for retention drops. Query-serving processes size the pool to their
//! request concurrency through the environment.

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use maskmap_core::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;
const DEFAULT_APPLICATION_NAME: &str = "maskmap";

/// Sizing and timeouts of the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    /// Reported in `pg_stat_activity`.
    pub application_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS)),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MASKMAP_DB_MAX_CONNECTIONS` | `10` |
    /// | `MASKMAP_DB_MIN_CONNECTIONS` | `1` |
    /// | `MASKMAP_DB_ACQUIRE_TIMEOUT_SECS` | `30` |
    /// | `MASKMAP_DB_APPLICATION_NAME` | `maskmap` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary key lookup.
    ///
    /// Unparseable values fall back to the default with a warning; pool
    /// sizing is never a reason to refuse to start.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        let number = |key: &str, fallback: u64| -> u64 {
            match lookup(key).map(|v| v.trim().parse::<u64>()) {
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    warn!(
                        subsystem = "database",
                        component = "pool",
                        key,
                        error = %e,
                        fallback,
                        "Ignoring invalid pool setting"
                    );
                    fallback
                }
                None => fallback,
            }
        };

        let max_connections =
            u32::try_from(number("MASKMAP_DB_MAX_CONNECTIONS", base.max_connections.into()))
                .unwrap_or(base.max_connections)
                .max(1);
        let min_connections =
            u32::try_from(number("MASKMAP_DB_MIN_CONNECTIONS", base.min_connections.into()))
                .unwrap_or(base.min_connections)
                .min(max_connections);

        Self {
            max_connections,
            min_connections,
            acquire_timeout: Duration::from_secs(number(
                "MASKMAP_DB_ACQUIRE_TIMEOUT_SECS",
                base.acquire_timeout.as_secs(),
            )),
            application_name: lookup("MASKMAP_DB_APPLICATION_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(base.application_name.clone()),
            ..base
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n.min(self.max_connections);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

/// Connect with the default pool configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Connect with an explicit pool configuration.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let connect_options = PgConnectOptions::from_str(database_url)
        .map_err(|e| Error::Config(format!("invalid DATABASE_URL: {}", e)))?
        .application_name(&config.application_name);

    info!(
        subsystem = "database",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        application_name = %config.application_name,
        "Creating database connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect_with(connect_options)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Log pool occupancy; warns when every connection is checked out.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );
    if size > 0 && idle == 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "All pooled connections are busy"
        );
    }
}
