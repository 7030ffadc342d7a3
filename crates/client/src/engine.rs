//! The assembled cache.
//!
//! [`CacheEngine`] wires the generation-key authority, the store proxy, the
//! query worker and the fetch coordinator together over one backing store.
//! A named query is turned into a storage key by resolving its generation key
//! and hashing it with the SQL text, so refreshing any dependency makes every
//! derived result unreachable without deleting anything.

use std::sync::Arc;
use std::time::Duration;

use gencache_core::{
    AppConfig, CacheProxy, Error, GenKey, GenKeyAuthority, KvStore, ProxyConfig, RawMatrix, compute_cache_key,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinatorConfig, FetchCoordinator};
use crate::request::FetchRequest;
use crate::source::{SourceConnector, SourceDescriptor, SourceRegistry};
use crate::worker::{QueryWorker, WorkerConfig};

/// A named query and how to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuery {
    /// Generation-key name the result is versioned under.
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub source: SourceDescriptor,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub job_id: String,
}

impl CachedQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>, source: SourceDescriptor) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            dependencies: Vec::new(),
            source,
            ttl_secs: None,
            limit: None,
            job_id: String::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Result of a named fetch.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub gen_key: GenKey,
    pub cache_key: String,
    pub result: RawMatrix,
}

pub struct CacheEngine {
    config: AppConfig,
    authority: GenKeyAuthority,
    proxy: CacheProxy,
    worker: Arc<QueryWorker>,
    coordinator: FetchCoordinator,
}

impl CacheEngine {
    /// Build an engine over `store`, running queries through `connector`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: AppConfig, store: Arc<dyn KvStore>, connector: Arc<dyn SourceConnector>) -> Self {
        let proxy = CacheProxy::new(
            store.clone(),
            ProxyConfig {
                poll_interval: config.poll_interval(),
                result_wait: config.result_wait(),
                stale_after: config.manifest_stale_after(),
            },
        );
        let authority = GenKeyAuthority::new(store, config.key_prefix.clone());
        let sources = Arc::new(SourceRegistry::new(connector));
        let worker = Arc::new(QueryWorker::new(proxy.clone(), sources, WorkerConfig::from(&config)));
        let coordinator = FetchCoordinator::new(proxy.clone(), worker.clone(), CoordinatorConfig::from(&config));

        Self { config, authority, proxy, worker, coordinator }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    async fn request_for(&self, query: &CachedQuery) -> Result<(GenKey, FetchRequest), Error> {
        if query.name.is_empty() {
            return Err(Error::InvalidInput("query name must not be empty".into()));
        }
        if query.sql.trim().is_empty() {
            return Err(Error::InvalidInput("sql must not be empty".into()));
        }

        let gen_key = self.authority.get_key(&query.name, &query.dependencies).await?;
        let ttl = match query.ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.default_ttl(),
        };
        let request = FetchRequest::new(compute_cache_key(&gen_key, &query.sql), &query.sql, query.source.clone())
            .with_dependencies(query.dependencies.clone())
            .with_ttl(ttl)
            .with_limit(query.limit)
            .with_job_id(&query.job_id);
        Ok((gen_key, request))
    }

    /// Return the current-generation result of `query`, computing it on a miss.
    pub async fn fetch(&self, query: &CachedQuery) -> Result<Fetched, Error> {
        let (gen_key, request) = self.request_for(query).await?;
        tracing::debug!(name = %query.name, version = gen_key.version, cache_key = %request.key, "fetch");
        let result = self.coordinator.fetch(&request).await?;
        Ok(Fetched { gen_key, cache_key: request.key, result })
    }

    /// Like [`CacheEngine::fetch`] but returns `NotReady` instead of waiting
    /// for a computation it started.
    pub async fn fetch_lazy(&self, query: &CachedQuery) -> Result<Fetched, Error> {
        let (gen_key, request) = self.request_for(query).await?;
        let result = self.coordinator.fetch_lazy(&request).await?;
        Ok(Fetched { gen_key, cache_key: request.key, result })
    }

    /// Fetch directly by storage key, bypassing generation keys.
    pub async fn fetch_key(&self, request: &FetchRequest) -> Result<RawMatrix, Error> {
        self.coordinator.fetch(request).await
    }

    /// Bump the version of every named generation key.
    pub async fn refresh(&self, names: &[String]) -> Result<Vec<GenKey>, Error> {
        let keys = self.authority.refresh(names).await?;
        tracing::info!(names = ?names, "refreshed generation keys");
        Ok(keys)
    }

    pub async fn is_valid(&self, key: &GenKey) -> Result<bool, Error> {
        self.authority.is_valid(key).await
    }

    pub async fn get_key(&self, name: &str, dependencies: &[String]) -> Result<GenKey, Error> {
        self.authority.get_key(name, dependencies).await
    }

    pub async fn get_result(&self, cache_key: &str) -> Result<RawMatrix, Error> {
        self.proxy.get_result(cache_key).await
    }

    pub async fn in_cache(&self, cache_key: &str) -> Result<bool, Error> {
        self.proxy.in_cache(cache_key).await
    }

    /// Empty the backing store, generation keys included.
    pub async fn clear(&self) -> Result<u64, Error> {
        let removed = self.proxy.clear().await?;
        self.authority.forget_all();
        Ok(removed)
    }

    pub fn cancel_job(&self, job_id: &str) -> usize {
        self.worker.cancel_job(job_id)
    }

    pub fn in_flight(&self) -> usize {
        self.worker.in_flight()
    }

    pub fn pending(&self) -> usize {
        self.coordinator.pending()
    }
}
