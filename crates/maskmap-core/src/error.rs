//! Error types for maskmap.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::names::VersionId;

/// Result type alias using maskmap's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for maskmap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Input has the wrong shape (missing coordinates, missing description, bad date)
    #[error("Malformed entity: {0}")]
    MalformedEntity(String),

    /// No record in the feed carries an `updated` timestamp
    #[error("Feed has no record with an update timestamp; cannot derive a version")]
    NoVersionTimestamp,

    /// Building the snapshot relation failed
    #[error("Materializing snapshot {version} failed: {source}")]
    MaterializeFailed {
        version: VersionId,
        #[source]
        source: Box<Error>,
    },

    /// Publishing the snapshot as current failed
    #[error("Cut-over to snapshot {version} failed: {source}")]
    CutoverFailed {
        version: VersionId,
        #[source]
        source: Box<Error>,
    },

    /// The registry could not be read
    #[error("Snapshot registry unavailable: {0}")]
    RegistryUnavailable(#[source] Box<Error>),

    /// A read against the current snapshot or a shard failed
    #[error("Query execution failed: {0}")]
    QueryExecutionFailed(#[source] Box<Error>),

    /// A concurrent writer created the shard first; callers treat this as success
    #[error("Shard {0} was created concurrently")]
    ShardCreateRace(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The external feed could not be fetched or decoded
    #[error("Feed error: {0}")]
    Feed(String),

    /// A bounded operation ran past its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

/// Machine-readable error kind surfaced to API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedEntity,
    NoVersionTimestamp,
    MaterializeFailed,
    CutoverFailed,
    RegistryUnavailable,
    QueryExecutionFailed,
    ShardCreateRace,
    NotFound,
    Feed,
    Timeout,
    Config,
    Internal,
}

impl Error {
    /// Wrap a storage error raised while building a snapshot.
    pub fn materialize(version: &VersionId, source: Error) -> Self {
        Error::MaterializeFailed {
            version: version.clone(),
            source: Box::new(source),
        }
    }

    /// Wrap a storage error raised while publishing a snapshot.
    pub fn cutover(version: &VersionId, source: Error) -> Self {
        Error::CutoverFailed {
            version: version.clone(),
            source: Box::new(source),
        }
    }

    /// Wrap a storage error raised while resolving the current snapshot.
    pub fn registry(source: Error) -> Self {
        match source {
            e @ Error::RegistryUnavailable(_) => e,
            other => Error::RegistryUnavailable(Box::new(other)),
        }
    }

    /// Wrap a storage error raised while serving a read.
    pub fn query(source: Error) -> Self {
        match source {
            e @ (Error::QueryExecutionFailed(_) | Error::RegistryUnavailable(_)) => e,
            other => Error::QueryExecutionFailed(Box::new(other)),
        }
    }

    /// Classify this error for API consumers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedEntity(_) => ErrorKind::MalformedEntity,
            Error::NoVersionTimestamp => ErrorKind::NoVersionTimestamp,
            Error::MaterializeFailed { .. } => ErrorKind::MaterializeFailed,
            Error::CutoverFailed { .. } => ErrorKind::CutoverFailed,
            Error::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            Error::QueryExecutionFailed(_) | Error::Database(_) => {
                ErrorKind::QueryExecutionFailed
            }
            Error::ShardCreateRace(_) => ErrorKind::ShardCreateRace,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Feed(_) | Error::Request(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::Feed
            }
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedEntity(_) | Error::NoVersionTimestamp | Error::NotFound(_)
        )
    }

    /// True for storage/infra errors where repeating the whole call is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::MaterializeFailed { .. }
                | Error::CutoverFailed { .. }
                | Error::RegistryUnavailable(_)
                | Error::QueryExecutionFailed(_)
                | Error::Timeout(_)
                | Error::Request(_)
                | Error::Io(_)
        )
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::MalformedEntity(_) | Error::NoVersionTimestamp => 400,
            Error::Timeout(_) => 504,
            Error::RegistryUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Response envelope carrying the kind and a human-readable message.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}
