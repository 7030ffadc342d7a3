//! Issues, refreshes and validates generation keys.
//!
//! Keys are persisted as JSON under `"{prefix}-{name}"` in the backing store,
//! which stays the system of record: every lookup reads through to it, so
//! refreshes made by other processes are seen immediately. An in-process index
//! mirrors the last key seen per name.
//!
//! Read-modify-write of one name is serialized by a per-name lock inside this
//! process only. Two processes refreshing the same name at once can still lose
//! an increment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use super::GenKey;
use crate::Error;
use crate::store::KvStore;

pub struct GenKeyAuthority {
    store: Arc<dyn KvStore>,
    prefix: String,
    index: DashMap<String, GenKey>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for GenKeyAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenKeyAuthority")
            .field("prefix", &self.prefix)
            .field("indexed", &self.index.len())
            .finish()
    }
}

impl GenKeyAuthority {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into(), index: DashMap::new(), locks: DashMap::new() }
    }

    fn storage_key(&self, name: &str) -> String {
        format!("{}-{name}", self.prefix)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_string()).or_default().clone()
    }

    /// Current key for `name`, read from the store.
    pub async fn current(&self, name: &str) -> Result<Option<GenKey>, Error> {
        let Some(bytes) = self.store.get(&self.storage_key(name)).await? else {
            self.index.remove(name);
            return Ok(None);
        };
        let key: GenKey = serde_json::from_slice(&bytes)?;
        self.index.insert(name.to_string(), key.clone());
        Ok(Some(key))
    }

    /// Last key this process read or wrote for `name`, without touching the store.
    pub fn cached(&self, name: &str) -> Option<GenKey> {
        self.index.get(name).map(|key| key.value().clone())
    }

    /// Drop the local mirror of `name`.
    pub fn forget_local(&self, name: &str) {
        self.index.remove(name);
    }

    /// Drop the whole local mirror, e.g. after the store was cleared.
    pub fn forget_all(&self) {
        self.index.clear();
    }

    async fn persist(&self, key: &GenKey) -> Result<(), Error> {
        let bytes = serde_json::to_vec(key)?;
        self.store.put(&self.storage_key(&key.name), Bytes::from(bytes)).await?;
        self.index.insert(key.name.clone(), key.clone());
        Ok(())
    }

    /// Resolve the key for `name` computed from `dependencies`.
    ///
    /// Creates the key on first use, starts a new lineage when the dependency
    /// set changed, and bumps the version when any dependency moved on since
    /// the stored snapshot. Missing dependencies are created at version 0.
    pub async fn get_key(&self, name: &str, dependencies: &[String]) -> Result<GenKey, Error> {
        let deps: BTreeSet<String> = dependencies.iter().cloned().collect();
        self.resolve(name, Some(deps), Vec::new()).await
    }

    fn resolve<'a>(
        &'a self, name: &'a str, deps: Option<BTreeSet<String>>, mut visiting: Vec<String>,
    ) -> BoxFuture<'a, Result<GenKey, Error>> {
        async move {
            if visiting.iter().any(|seen| seen == name) {
                visiting.push(name.to_string());
                return Err(Error::CyclicDependency(visiting.join(" -> ")));
            }
            visiting.push(name.to_string());

            // A dependency resolved on someone else's behalf keeps its own recorded set.
            let deps = match deps {
                Some(deps) => deps,
                None => self
                    .current(name)
                    .await?
                    .map(|key| key.dep_gen.into_keys().collect())
                    .unwrap_or_default(),
            };

            let mut snapshot = BTreeMap::new();
            for dep in deps {
                let dep_key = self.resolve(&dep, None, visiting.clone()).await?;
                snapshot.insert(dep, dep_key.version);
            }

            let lock = self.lock_for(name);
            let _guard = lock.lock().await;

            match self.current(name).await? {
                None => {
                    let key = GenKey::new(name, snapshot);
                    self.persist(&key).await?;
                    tracing::debug!(name, unique_id = %key.unique_id, "created generation key");
                    Ok(key)
                }
                Some(existing) if !existing.dep_gen.keys().eq(snapshot.keys()) => {
                    let key = GenKey::new(name, snapshot);
                    self.persist(&key).await?;
                    tracing::info!(
                        name,
                        previous = %existing.unique_id,
                        unique_id = %key.unique_id,
                        "dependency set changed, started new lineage"
                    );
                    Ok(key)
                }
                Some(mut existing) => {
                    if existing.dep_gen != snapshot {
                        existing.version += 1;
                        existing.dep_gen = snapshot;
                        self.persist(&existing).await?;
                        tracing::debug!(name, version = existing.version, "dependency moved, bumped version");
                    }
                    Ok(existing)
                }
            }
        }
        .boxed()
    }

    /// Invalidate every name in `names` by bumping its version.
    ///
    /// Names that have no key yet are created first, so they end at version 1.
    pub async fn refresh(&self, names: &[String]) -> Result<Vec<GenKey>, Error> {
        let mut refreshed = Vec::with_capacity(names.len());
        for name in names {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;

            let mut key = match self.current(name).await? {
                Some(key) => key,
                None => GenKey::new(name.as_str(), BTreeMap::new()),
            };
            key.version += 1;
            self.persist(&key).await?;
            tracing::info!(name = %name, version = key.version, "refreshed generation key");
            refreshed.push(key);
        }
        Ok(refreshed)
    }

    /// Whether `key` is still the current generation of its name.
    ///
    /// Compares lineage and version with the stored key, then checks that no
    /// dependency recorded in `key.dep_gen` has moved on, transitively. Never
    /// writes.
    pub async fn is_valid(&self, key: &GenKey) -> Result<bool, Error> {
        self.is_current(key, Vec::new()).await
    }

    fn is_current<'a>(&'a self, key: &'a GenKey, mut visiting: Vec<String>) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            if visiting.iter().any(|seen| *seen == key.name) {
                visiting.push(key.name.clone());
                return Err(Error::CyclicDependency(visiting.join(" -> ")));
            }
            visiting.push(key.name.clone());

            match self.current(&key.name).await? {
                Some(current) if current.same_generation(key) => {}
                _ => return Ok(false),
            }

            for (dep, recorded) in &key.dep_gen {
                let Some(dep_key) = self.current(dep).await? else {
                    return Ok(false);
                };
                if dep_key.version != *recorded || !self.is_current(&dep_key, visiting.clone()).await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }
}
