//! Redis-backed store shared between processes.
//!
//! All keys are written under a namespace so that `clear` only removes what
//! this cache owns.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::KvStore;
use crate::Error;

pub const DEFAULT_NAMESPACE: &str = "gencache:";

const SCAN_BATCH: usize = 500;

/// Remote store over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<ConnectionManager>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisStore {
    /// Connect to `url` and namespace every key with `namespace`.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(namespace, "connected to redis store");
        Ok(Self { conn, namespace: namespace.to_string() })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error> {
        let _: () = self.conn.clone().set(self.namespaced(key), value.as_ref()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        let value: Option<Vec<u8>> = self.conn.clone().get(self.namespaced(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.conn.clone().exists(self.namespaced(key)).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let millis = ttl.as_millis().max(1) as i64;
        Ok(self.conn.clone().pexpire(self.namespaced(key), millis).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let removed: u64 = self.conn.clone().del(self.namespaced(key)).await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<u64, Error> {
        let pattern = format!("{}*", self.namespace);
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut removed = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let count: u64 = conn.del(&keys).await?;
                removed += count;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::info!(removed, namespace = %self.namespace, "cleared redis store");
        Ok(removed)
    }
}
