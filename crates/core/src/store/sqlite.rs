//! SQLite-backed store with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for performance and concurrency (WAL mode), and running migrations. Expiry
//! deadlines are stored as unix milliseconds and checked on every read.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio_rusqlite::{Connection, params};

use super::{KvStore, migrations};
use crate::Error;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

/// Persistent local store.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pub(crate) conn: Connection,
}

impl SqliteStore {
    /// Open a database at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        Ok(Self { conn })
    }

    /// Delete expired entries.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![now],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO entries (key, value, updated_at, expires_at) VALUES (?1, ?2, ?3, NULL)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at,
                        expires_at = NULL",
                    params![key, value.as_ref(), now],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<Option<Bytes>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT value FROM entries
                    WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )?;

                match stmt.query_row(params![key, now], |row| row.get::<_, Vec<u8>>(0)) {
                    Ok(value) => Ok(Some(Bytes::from(value))),
                    Err(tokio_rusqlite::rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM entries
                        WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                    )",
                    params![key, now],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
            .map_err(Error::from)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        let deadline = now + ttl.as_millis() as i64;
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated = conn.execute(
                    "UPDATE entries SET expires_at = ?2
                    WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                    params![key, deadline, now],
                )?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                Ok(conn.execute("DELETE FROM entries WHERE key = ?1", params![key])? > 0)
            })
            .await
            .map_err(Error::from)
    }

    async fn clear(&self) -> Result<u64, Error> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction()?;
                let live: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM entries WHERE expires_at IS NULL OR expires_at > ?1",
                    params![now],
                    |row| row.get(0),
                )?;
                tx.execute("DELETE FROM entries", [])?;
                tx.commit()?;
                Ok(live as u64)
            })
            .await
            .map_err(Error::from)
    }
}
