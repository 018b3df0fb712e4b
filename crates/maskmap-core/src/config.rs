//! Runtime configuration for the store and the sync trigger.

use std::time::Duration;

use chrono_tz::Tz;
use tracing::debug;

use crate::defaults;
use crate::error::{Error, Result};

/// Settings shared by the snapshot store, the feedback store and ingestion.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    /// Snapshots kept by retention GC (at least 1).
    pub retention: usize,
    /// Records per insert batch (at least 1).
    pub batch_size: usize,
    /// Result cap used when a caller gives none.
    pub default_max: u64,
    /// Zone for feed timestamps and shard keys.
    pub timezone: Tz,
    /// `http(s)://` URL or local path of the feed.
    pub feed_source: String,
    pub ingest_timeout: Duration,
    pub query_timeout: Duration,
    pub sync_interval: Duration,
    /// Run a single ingestion and exit.
    pub sync_once: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            retention: defaults::RETENTION,
            batch_size: defaults::BATCH_SIZE,
            default_max: defaults::QUERY_MAX,
            timezone: chrono_tz::Asia::Taipei,
            feed_source: defaults::FEED_SOURCE.to_string(),
            ingest_timeout: Duration::from_secs(defaults::INGEST_TIMEOUT_SECS),
            query_timeout: Duration::from_secs(defaults::QUERY_TIMEOUT_SECS),
            sync_interval: Duration::from_secs(defaults::SYNC_INTERVAL_SECS),
            sync_once: false,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | `postgres://localhost/maskmap` | Storage backend |
    /// | `MASKMAP_RETENTION` | `5` | Snapshots kept by GC |
    /// | `MASKMAP_BATCH_SIZE` | `500` | Records per insert batch |
    /// | `MASKMAP_DEFAULT_MAX` | `100` | Default nearby result cap |
    /// | `MASKMAP_TIMEZONE` | `Asia/Taipei` | IANA zone |
    /// | `MASKMAP_FEED_SOURCE` | points.json URL | Feed URL or path |
    /// | `MASKMAP_INGEST_TIMEOUT_SECS` | `50` | Ingestion deadline |
    /// | `MASKMAP_QUERY_TIMEOUT_SECS` | `10` | Query deadline |
    /// | `MASKMAP_SYNC_INTERVAL_SECS` | `300` | Trigger interval |
    /// | `MASKMAP_SYNC_ONCE` | `false` | Ingest once and exit |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let parse_u64 = |key: &str, fallback: u64| -> Result<u64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| Error::Config(format!("{} must be an integer: {}", key, e))),
                None => Ok(fallback),
            }
        };

        let timezone = match lookup("MASKMAP_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|e| Error::Config(format!("MASKMAP_TIMEZONE: {}", e)))?,
            None => base.timezone,
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(base.database_url),
            retention: (parse_u64("MASKMAP_RETENTION", base.retention as u64)? as usize).max(1),
            batch_size: (parse_u64("MASKMAP_BATCH_SIZE", base.batch_size as u64)? as usize)
                .max(1),
            default_max: parse_u64("MASKMAP_DEFAULT_MAX", base.default_max)?,
            timezone,
            feed_source: lookup("MASKMAP_FEED_SOURCE").unwrap_or(base.feed_source),
            ingest_timeout: Duration::from_secs(parse_u64(
                "MASKMAP_INGEST_TIMEOUT_SECS",
                base.ingest_timeout.as_secs(),
            )?),
            query_timeout: Duration::from_secs(parse_u64(
                "MASKMAP_QUERY_TIMEOUT_SECS",
                base.query_timeout.as_secs(),
            )?),
            sync_interval: Duration::from_secs(
                parse_u64("MASKMAP_SYNC_INTERVAL_SECS", base.sync_interval.as_secs())?.max(1),
            ),
            sync_once: lookup("MASKMAP_SYNC_ONCE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        };

        debug!(
            subsystem = "config",
            retention = config.retention,
            batch_size = config.batch_size,
            timezone = %config.timezone,
            "Loaded store configuration"
        );
        Ok(config)
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_feed_source(mut self, source: impl Into<String>) -> Self {
        self.feed_source = source.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.retention, 5);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.timezone, chrono_tz::Asia::Taipei);
        assert_eq!(config.ingest_timeout, Duration::from_secs(50));
        assert!(!config.sync_once);
    }

    #[test]
    fn test_overrides() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("MASKMAP_RETENTION", "3"),
            ("MASKMAP_BATCH_SIZE", "250"),
            ("MASKMAP_TIMEZONE", "UTC"),
            ("MASKMAP_FEED_SOURCE", "/tmp/points.json"),
            ("MASKMAP_SYNC_ONCE", "1"),
        ]))
        .unwrap();
        assert_eq!(config.retention, 3);
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.feed_source, "/tmp/points.json");
        assert!(config.sync_once);
    }

    #[test]
    fn test_zero_retention_is_clamped() {
        let config = StoreConfig::from_lookup(lookup(&[("MASKMAP_RETENTION", "0")])).unwrap();
        assert_eq!(config.retention, 1);
    }

    #[test]
    fn test_invalid_timezone_is_config_error() {
        let err = StoreConfig::from_lookup(lookup(&[("MASKMAP_TIMEZONE", "Mars/Olympus")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_integer_is_config_error() {
        let err =
            StoreConfig::from_lookup(lookup(&[("MASKMAP_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("MASKMAP_BATCH_SIZE"));
    }
}
