//! # maskmap-core
//!
//! Core types, traits, and abstractions for the maskmap point-of-interest
//! directory.
//!
//! This crate provides the domain records, the controlled version and shard
//! identifiers, the error taxonomy and the storage backend traits that the
//! other maskmap crates depend on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod geo;
pub mod ids;
pub mod logging;
pub mod models;
pub mod names;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::StoreConfig;
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use geo::{great_circle_miles, BoundingBox, LngLat, NearbyQuery};
pub use ids::{IdGenerator, NanoIdGenerator};
pub use models::*;
pub use names::{ShardKey, VersionId};
pub use traits::*;
