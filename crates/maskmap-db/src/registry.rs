//! Cached pointer to the current snapshot.
//!
//! The registry row in the backend is the source of truth. The cache is a
//! guarded value with an explicit invalidate/resolve contract; a generation
//! counter keeps a refresh that raced with an invalidation from writing a
//! stale pointer back.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use maskmap_core::{Error, Result, SnapshotBackend, VersionId};

#[derive(Debug, Default)]
struct Pointer {
    version: Option<VersionId>,
    generation: u64,
}

/// Resolves and caches the version of the current snapshot.
pub struct SnapshotRegistry {
    backend: Arc<dyn SnapshotBackend>,
    pointer: RwLock<Pointer>,
}

impl SnapshotRegistry {
    pub fn new(backend: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            backend,
            pointer: RwLock::new(Pointer::default()),
        }
    }

    /// Version of the current snapshot.
    ///
    /// Served from the cache when warm; otherwise read from the backend.
    /// Returns `NotFound` when nothing has been committed yet and
    /// `RegistryUnavailable` when the backend cannot answer.
    pub async fn resolve_current(&self) -> Result<VersionId> {
        if let Some(version) = self.pointer.read().await.version.clone() {
            return Ok(version);
        }
        self.refresh().await
    }

    /// Bypass the cache and re-read the backend's registry.
    pub async fn refresh(&self) -> Result<VersionId> {
        let generation = self.pointer.read().await.generation;

        let registered = self
            .backend
            .registered_version()
            .await
            .map_err(Error::registry)?;

        let Some(version) = registered else {
            debug!(
                subsystem = "registry",
                op = "resolve",
                "No snapshot registered yet"
            );
            return Err(Error::NotFound("no current snapshot".to_string()));
        };

        let mut pointer = self.pointer.write().await;
        if pointer.generation == generation {
            if pointer.version.as_ref().map_or(true, |c| *c <= version) {
                pointer.version = Some(version.clone());
            }
        } else {
            debug!(
                subsystem = "registry",
                op = "resolve",
                version = %version,
                "Pointer changed during refresh, not caching"
            );
        }
        debug!(
            subsystem = "registry",
            op = "resolve",
            version = %version,
            "Resolved current snapshot from backend"
        );
        Ok(version)
    }

    /// Drop the cached pointer; the next resolve reads the backend.
    pub async fn invalidate(&self) {
        let mut pointer = self.pointer.write().await;
        pointer.version = None;
        pointer.generation = pointer.generation.wrapping_add(1);
    }

    /// Record a version the caller just made current.
    ///
    /// Never moves the cached pointer backwards.
    pub async fn set_current(&self, version: VersionId) {
        let mut pointer = self.pointer.write().await;
        match pointer.version {
            Some(ref current) if *current > version => {
                warn!(
                    subsystem = "registry",
                    op = "set_current",
                    version = %version,
                    current = %current,
                    "Ignoring attempt to move pointer backwards"
                );
            }
            _ => pointer.version = Some(version),
        }
        pointer.generation = pointer.generation.wrapping_add(1);
    }

    /// Cached pointer without touching the backend.
    pub async fn cached(&self) -> Option<VersionId> {
        self.pointer.read().await.version.clone()
    }
}
