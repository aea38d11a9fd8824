//! Baseline store adapter -- the key-value capability the detector persists to.
//!
//! Backends hold opaque bytes with optional expiry. The detector owns the
//! encoding; stores never interpret values.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Key-value contract for persisted baseline state.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Fetch a value. Missing or expired keys are `None`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Upsert a value. `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Replace the expiry of an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop expired entries eagerly.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// True when every call is bounded by the backend itself and an error
    /// means the change was not applied. Callers then wait for the outcome
    /// instead of abandoning the call on their own timeout.
    fn bounds_own_io(&self) -> bool {
        false
    }
}

/// Store key under which an entity's baseline lives.
pub fn baseline_key(entity: &str) -> String {
    format!("baseline:{entity}")
}

/// Convert a TTL in seconds to the store form; zero means no expiry.
pub fn ttl_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Open the backend selected in configuration.
pub fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn BaselineStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("using in-memory baseline store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            tracing::info!(path = %config.sqlite_path.display(), "opening sqlite baseline store");
            let store = SqliteStore::open(&config.sqlite_path, config.io_timeout())?;
            Ok(Arc::new(store))
        }
    }
}
