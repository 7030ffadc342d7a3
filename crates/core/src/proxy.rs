//! Cache-store proxy.
//!
//! Thin layer over a [`KvStore`] that speaks [`CacheEntry`] instead of bytes
//! and turns whatever lives under a key back into one logical [`RawMatrix`]:
//!
//! - a matrix is returned as-is
//! - a reference is followed, failing fatally if a key is revisited
//! - a chunk manifest is read chunk by chunk, re-reading the manifest while
//!   the writer has not marked it `done`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::Error;
use crate::model::{CacheEntry, RawMatrix, ValuesList, codec};
use crate::store::KvStore;

/// Readiness of the value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Missing,
    Ready,
    /// A chunk manifest whose writer has not finished yet.
    InProgress,
    /// A chunk manifest whose writer gave up.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Delay between re-reads of an unfinished manifest.
    pub poll_interval: Duration,
    /// How long `get_result` waits for an unfinished manifest.
    pub result_wait: Duration,
    /// An unfinished manifest not re-written for this long is treated as failed.
    pub stale_after: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            result_wait: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheProxy {
    store: Arc<dyn KvStore>,
    config: ProxyConfig,
}

impl CacheProxy {
    pub fn new(store: Arc<dyn KvStore>, config: ProxyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), Error> {
        self.store.put(key, bytes).await
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>, Error> {
        self.store.get(key).await
    }

    /// Encode and store `entry` under `key`.
    pub async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), Error> {
        let bytes = codec::encode(entry)?;
        self.store.put(key, Bytes::from(bytes)).await
    }

    /// Fetch and decode the entry under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(codec::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn in_cache(&self, key: &str) -> Result<bool, Error> {
        self.store.exists(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        self.store.expire(key, ttl).await
    }

    pub async fn clear(&self) -> Result<u64, Error> {
        let removed = self.store.clear().await?;
        tracing::info!(removed, "cleared cache store");
        Ok(removed)
    }

    /// Classify the entry under `key` without reading any chunk.
    ///
    /// References are followed; a reference to a missing key reads as missing.
    pub async fn status(&self, key: &str) -> Result<EntryStatus, Error> {
        let mut visited = HashSet::new();
        let mut current = key.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(Error::CyclicReference { origin: key.to_string(), key: current });
            }
            match self.get(&current).await? {
                None => return Ok(EntryStatus::Missing),
                Some(CacheEntry::Matrix(_)) => return Ok(EntryStatus::Ready),
                Some(CacheEntry::Reference { reference_key }) => current = reference_key,
                Some(CacheEntry::ValuesList(list)) if list.error => return Ok(EntryStatus::Failed),
                Some(CacheEntry::ValuesList(list)) if list.done => return Ok(EntryStatus::Ready),
                Some(CacheEntry::ValuesList(list)) if list.is_abandoned(self.config.stale_after) => {
                    tracing::warn!(key = %current, updated_at = ?list.updated_at, "chunk manifest abandoned by its writer");
                    return Ok(EntryStatus::Failed);
                }
                Some(CacheEntry::ValuesList(_)) => return Ok(EntryStatus::InProgress),
            }
        }
    }

    /// Resolve `key` into a single result.
    ///
    /// The returned matrix reports `key` as its key and `from_cache = true`,
    /// wherever it was physically stored.
    ///
    /// # Errors
    ///
    /// - `CacheMiss` if nothing is stored under `key` or a referenced key
    /// - `CyclicReference` if a reference chain revisits a key
    /// - `ComputationFailed` if a chunk manifest is marked as failed or its
    ///   writer stopped updating it for `stale_after`
    /// - `NotReady` if a manifest is still unfinished after `result_wait`
    pub async fn get_result(&self, key: &str) -> Result<RawMatrix, Error> {
        let mut visited = HashSet::new();
        let mut current = key.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(Error::CyclicReference { origin: key.to_string(), key: current });
            }
            match self.get(&current).await? {
                None => return Err(Error::CacheMiss(current)),
                Some(CacheEntry::Matrix(matrix)) => return Ok(matrix.tagged(key, true)),
                Some(CacheEntry::Reference { reference_key }) => {
                    tracing::trace!(from = %current, to = %reference_key, "following cache reference");
                    current = reference_key;
                }
                Some(CacheEntry::ValuesList(list)) => {
                    let matrix = self.assemble(key, &current, list, &mut visited).await?;
                    return Ok(matrix.tagged(key, true));
                }
            }
        }
    }

    /// Merge the chunks of the manifest stored at `manifest_key`, in order.
    async fn assemble(
        &self, origin: &str, manifest_key: &str, mut list: ValuesList, visited: &mut HashSet<String>,
    ) -> Result<RawMatrix, Error> {
        let deadline = Instant::now() + self.config.result_wait;
        let mut merged: Option<RawMatrix> = None;
        let mut processed = 0usize;
        let mut truncated = false;

        loop {
            if list.error {
                return Err(Error::ComputationFailed {
                    key: origin.to_string(),
                    reason: "chunked write was marked as failed".into(),
                });
            }
            if list.is_abandoned(self.config.stale_after) {
                return Err(Error::ComputationFailed {
                    key: origin.to_string(),
                    reason: format!("writer stopped updating the manifest after {} chunks", list.chunks.len()),
                });
            }

            for chunk in &list.chunks[processed..] {
                let part = self.resolve_chunk(origin, &chunk.key, visited).await?;
                truncated = part.has_more;
                if let Some(matrix) = merged.as_mut() {
                    matrix.merge(part)?;
                } else {
                    merged = Some(part);
                }
            }
            processed = list.chunks.len();

            if list.done {
                break;
            }

            if Instant::now() >= deadline {
                return Err(Error::NotReady(format!("{origin}: {processed} chunks written so far")));
            }
            tokio::time::sleep(self.config.poll_interval).await;

            list = match self.get(manifest_key).await? {
                Some(CacheEntry::ValuesList(next)) if next.chunks.len() >= processed => next,
                Some(CacheEntry::ValuesList(_)) => {
                    return Err(Error::Decode(format!("manifest at {manifest_key} lost chunks while reading")));
                }
                Some(other) => {
                    return Err(Error::Decode(format!(
                        "manifest at {manifest_key} was replaced by a {}",
                        other.kind()
                    )));
                }
                None => return Err(Error::CacheMiss(manifest_key.to_string())),
            };
        }

        let mut matrix = merged.ok_or_else(|| Error::Decode(format!("manifest at {manifest_key} has no chunks")))?;
        // Every chunk but the last flags has_more; the last one carries truncation.
        matrix.has_more = truncated;
        Ok(matrix)
    }

    /// A chunk must end in a matrix, possibly behind references.
    async fn resolve_chunk(
        &self, origin: &str, chunk_key: &str, visited: &mut HashSet<String>,
    ) -> Result<RawMatrix, Error> {
        let mut current = chunk_key.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(Error::CyclicReference { origin: origin.to_string(), key: current });
            }
            match self.get(&current).await? {
                None => return Err(Error::CacheMiss(current)),
                Some(CacheEntry::Matrix(matrix)) => return Ok(matrix),
                Some(CacheEntry::Reference { reference_key }) => current = reference_key,
                Some(CacheEntry::ValuesList(_)) => {
                    return Err(Error::Decode(format!("chunk {current} of {origin} is itself a manifest")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkRef, Value};
    use crate::store::MemoryStore;

    fn proxy() -> CacheProxy {
        CacheProxy::new(
            Arc::new(MemoryStore::new()),
            ProxyConfig {
                poll_interval: Duration::from_millis(5),
                result_wait: Duration::from_millis(500),
                ..ProxyConfig::default()
            },
        )
    }

    fn matrix(range: std::ops::Range<i64>) -> RawMatrix {
        RawMatrix::new(vec!["n".into()], vec!["INTEGER".into()], range.map(|n| vec![Value::Int(n)]).collect())
    }

    async fn put_chunked(proxy: &CacheProxy, key: &str, bounds: &[(i64, i64)], done: bool) -> ValuesList {
        let mut list = ValuesList::default();
        for (lower, upper) in bounds {
            let chunk = ChunkRef::new(key, *lower as u64, *upper as u64);
            proxy.put(&chunk.key, &CacheEntry::Matrix(matrix(*lower..*upper))).await.unwrap();
            list.push(chunk);
        }
        list.done = done;
        list.touch();
        proxy.put(key, &CacheEntry::ValuesList(list.clone())).await.unwrap();
        list
    }

    #[tokio::test]
    async fn test_matrix_result_tagged() {
        let proxy = proxy();
        proxy.put("k", &CacheEntry::Matrix(matrix(0..3))).await.unwrap();
        let result = proxy.get_result("k").await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.key.as_deref(), Some("k"));
        assert!(result.from_cache);
    }

    #[tokio::test]
    async fn test_reference_keeps_original_key() {
        let proxy = proxy();
        proxy.put("target", &CacheEntry::Matrix(matrix(0..2))).await.unwrap();
        proxy.put("alias", &CacheEntry::Reference { reference_key: "target".into() }).await.unwrap();

        let result = proxy.get_result("alias").await.unwrap();
        assert_eq!(result.key.as_deref(), Some("alias"));
        assert_eq!(result.rows, matrix(0..2).rows);
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let proxy = proxy();
        proxy.put("A", &CacheEntry::Reference { reference_key: "B".into() }).await.unwrap();
        proxy.put("B", &CacheEntry::Reference { reference_key: "A".into() }).await.unwrap();

        let err = proxy.get_result("A").await.unwrap_err();
        assert!(matches!(err, Error::CyclicReference { ref key, .. } if key == "A"));
        assert!(err.is_fatal());
        assert!(proxy.status("A").await.is_err());
    }

    #[tokio::test]
    async fn test_self_reference_detected() {
        let proxy = proxy();
        proxy.put("A", &CacheEntry::Reference { reference_key: "A".into() }).await.unwrap();
        assert!(matches!(proxy.get_result("A").await, Err(Error::CyclicReference { .. })));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let proxy = proxy();
        assert!(matches!(proxy.get_result("nope").await, Err(Error::CacheMiss(_))));
        assert_eq!(proxy.status("nope").await.unwrap(), EntryStatus::Missing);
    }

    #[tokio::test]
    async fn test_chunks_merged_in_order() {
        let proxy = proxy();
        put_chunked(&proxy, "big", &[(0, 4), (4, 8), (8, 10)], true).await;

        let result = proxy.get_result("big").await.unwrap();
        assert_eq!(result.rows, matrix(0..10).rows);
        assert!(!result.has_more);
        assert_eq!(proxy.status("big").await.unwrap(), EntryStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_manifest_not_resolvable() {
        let proxy = proxy();
        let mut list = put_chunked(&proxy, "bad", &[(0, 2)], false).await;
        list.error = true;
        proxy.put("bad", &CacheEntry::ValuesList(list)).await.unwrap();

        assert!(matches!(proxy.get_result("bad").await, Err(Error::ComputationFailed { .. })));
        assert_eq!(proxy.status("bad").await.unwrap(), EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_reads_manifest_still_being_written() {
        let proxy = proxy();
        let mut list = put_chunked(&proxy, "live", &[(0, 3)], false).await;
        assert_eq!(proxy.status("live").await.unwrap(), EntryStatus::InProgress);

        let writer = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let chunk = ChunkRef::new("live", 3, 6);
                proxy.put(&chunk.key, &CacheEntry::Matrix(matrix(3..6))).await.unwrap();
                list.push(chunk);
                list.done = true;
                proxy.put("live", &CacheEntry::ValuesList(list)).await.unwrap();
            })
        };

        let result = proxy.get_result("live").await.unwrap();
        writer.await.unwrap();
        assert_eq!(result.rows, matrix(0..6).rows);
    }

    #[tokio::test]
    async fn test_unfinished_manifest_times_out() {
        let proxy = proxy();
        put_chunked(&proxy, "stuck", &[(0, 1)], false).await;
        assert!(matches!(proxy.get_result("stuck").await, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_unstamped_manifest_reads_as_failed() {
        let proxy = proxy();
        let mut list = put_chunked(&proxy, "orphan", &[(0, 1)], false).await;
        list.updated_at = None;
        proxy.put("orphan", &CacheEntry::ValuesList(list)).await.unwrap();

        assert_eq!(proxy.status("orphan").await.unwrap(), EntryStatus::Failed);
        assert!(matches!(proxy.get_result("orphan").await, Err(Error::ComputationFailed { .. })));
    }

    #[tokio::test]
    async fn test_manifest_going_quiet_fails_reader() {
        let proxy = CacheProxy::new(
            Arc::new(MemoryStore::new()),
            ProxyConfig {
                poll_interval: Duration::from_millis(5),
                result_wait: Duration::from_secs(5),
                stale_after: Duration::from_millis(40),
            },
        );
        put_chunked(&proxy, "quiet", &[(0, 2)], false).await;
        assert_eq!(proxy.status("quiet").await.unwrap(), EntryStatus::InProgress);

        let started = Instant::now();
        assert!(matches!(proxy.get_result("quiet").await, Err(Error::ComputationFailed { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(proxy.status("quiet").await.unwrap(), EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_legacy_bytes_readable() {
        let proxy = proxy();
        let legacy = serde_json::to_vec(&matrix(0..2)).unwrap();
        proxy.put_bytes("old", Bytes::from(legacy)).await.unwrap();
        assert_eq!(proxy.get_result("old").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_and_in_cache() {
        let proxy = proxy();
        proxy.put("k", &CacheEntry::Matrix(matrix(0..1))).await.unwrap();
        assert!(proxy.in_cache("k").await.unwrap());
        proxy.clear().await.unwrap();
        assert!(!proxy.in_cache("k").await.unwrap());
    }
}
