//! Controlled identifiers for versioned and sharded relations.
//!
//! Every dynamic relation name in the store is derived from one of these two
//! types. Both are fixed-width, zero-padded and therefore sort
//! lexicographically in chronological order. Neither can be built from an
//! arbitrary string: parsing round-trips through chrono and rejects anything
//! that does not re-format to the exact same text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// chrono format of a snapshot version, e.g. `2020_0204_183000`.
pub const VERSION_FORMAT: &str = "%Y_%m%d_%H%M%S";

/// chrono format of a feedback shard key, e.g. `2020_0204`.
pub const SHARD_FORMAT: &str = "%Y_%m%d";

/// Relation name prefix of snapshot tables.
pub const SNAPSHOT_PREFIX: &str = "pharmacy_";

/// Relation name prefix of feedback shard tables.
pub const SHARD_PREFIX: &str = "feedback_";

/// Prefix of relations holding a snapshot that is still being built.
pub const STAGING_PREFIX: &str = "staging_pharmacy_";

/// Identifier of one snapshot, derived from the feed's own update timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Derive a version from a feed timestamp, in whatever zone it was read.
    pub fn from_timestamp<Tz: TimeZone>(ts: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self(ts.format(VERSION_FORMAT).to_string())
    }

    /// Parse and validate a version string.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = NaiveDateTime::parse_from_str(s, VERSION_FORMAT).map_err(|e| {
            Error::MalformedEntity(format!("invalid version identifier '{}': {}", s, e))
        })?;
        if parsed.format(VERSION_FORMAT).to_string() != s {
            return Err(Error::MalformedEntity(format!(
                "version identifier '{}' is not in canonical form",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Recover a version from a snapshot relation name; `None` for any other relation.
    pub fn from_table_name(name: &str) -> Option<Self> {
        name.strip_prefix(SNAPSHOT_PREFIX)
            .and_then(|rest| Self::parse(rest).ok())
    }

    /// Inverse of [`staging_table_name`](Self::staging_table_name).
    pub fn from_staging_table_name(name: &str) -> Option<Self> {
        name.strip_prefix(STAGING_PREFIX)
            .and_then(|rest| Self::parse(rest).ok())
    }

    /// Name of the published snapshot relation.
    pub fn table_name(&self) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, self.0)
    }

    /// Name of the relation the snapshot is built in before publishing.
    pub fn staging_table_name(&self) -> String {
        format!("{}{}", STAGING_PREFIX, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VersionId> for String {
    fn from(v: VersionId) -> Self {
        v.0
    }
}

/// Key of one feedback shard: a calendar day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardKey(String);

impl ShardKey {
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format(SHARD_FORMAT).to_string())
    }

    /// Shard holding records created at `ts`, using the calendar of `tz`.
    pub fn for_instant<Tz: TimeZone>(ts: &DateTime<chrono::Utc>, tz: &Tz) -> Self {
        Self::for_date(ts.with_timezone(tz).date_naive())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parsed = NaiveDate::parse_from_str(s, SHARD_FORMAT)
            .map_err(|e| Error::MalformedEntity(format!("invalid shard key '{}': {}", s, e)))?;
        if parsed.format(SHARD_FORMAT).to_string() != s {
            return Err(Error::MalformedEntity(format!(
                "shard key '{}' is not in canonical form",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        name.strip_prefix(SHARD_PREFIX)
            .and_then(|rest| Self::parse(rest).ok())
    }

    pub fn table_name(&self) -> String {
        format!("{}{}", SHARD_PREFIX, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShardKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ShardKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ShardKey> for String {
    fn from(k: ShardKey) -> Self {
        k.0
    }
}
