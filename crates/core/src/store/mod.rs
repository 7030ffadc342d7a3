//! Key/value backing stores.
//!
//! The backing store is the system of record for generation keys and cached
//! results. Every backend implements the same [`KvStore`] contract:
//!
//! - [`MemoryStore`]: in-process map, used by tests and offline mode
//! - [`SqliteStore`]: persistent local store with WAL mode and migrations
//! - [`RedisStore`]: shared remote store
//!
//! Eviction is left entirely to the backend; the cache only sets expiries.

pub mod memory;
pub mod migrations;
pub mod remote;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Error;

pub use memory::MemoryStore;
pub use remote::RedisStore;
pub use sqlite::SqliteStore;

/// Contract shared by every backing store.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error>;

    /// Fetch the value under `key`; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Set a time-to-live on `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    async fn delete(&self, key: &str) -> Result<bool, Error>;

    /// Remove every key owned by this store. Returns the number removed.
    async fn clear(&self) -> Result<u64, Error>;
}

/// Open a store from a URL.
///
/// Accepts `memory://`, `sqlite://<path>`, `sqlite::memory:` and
/// `redis://` / `rediss://` URLs.
pub async fn open_store(url: &str) -> Result<Arc<dyn KvStore>, Error> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url == "sqlite::memory:" {
        return Ok(Arc::new(SqliteStore::open_in_memory().await?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteStore::open(path).await?));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisStore::connect(url, remote::DEFAULT_NAMESPACE).await?));
    }
    Err(Error::InvalidInput(format!("unsupported store url: {url}")))
}
