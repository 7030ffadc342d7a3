//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (GENCACHE_*)
//! 2. TOML config file (if GENCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// How a lazy lookup treats a chunked result that is still being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InProgressPolicy {
    /// Report "not ready" and let the caller come back later.
    #[default]
    Miss,
    /// Wait for the remaining chunks and return the full result.
    Wait,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (GENCACHE_*)
/// 2. TOML config file (if GENCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backing store location: `memory://`, `sqlite://<path>` or `redis://<host>`.
    ///
    /// Set via GENCACHE_STORE_URL environment variable.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Namespace prefix for persisted generation keys.
    ///
    /// Set via GENCACHE_KEY_PREFIX environment variable.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Maximum rows buffered into a single chunk.
    ///
    /// Set via GENCACHE_CHUNK_MAX_ROWS environment variable.
    #[serde(default = "default_chunk_max_rows")]
    pub chunk_max_rows: usize,

    /// Maximum approximate bytes buffered into a single chunk.
    ///
    /// Set via GENCACHE_CHUNK_MAX_BYTES environment variable.
    #[serde(default = "default_chunk_max_bytes")]
    pub chunk_max_bytes: usize,

    /// Concurrent executions allowed per data source.
    ///
    /// Set via GENCACHE_POOL_SIZE environment variable.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Route every source through one shared pool.
    ///
    /// Set via GENCACHE_DEBUG_SINGLE_POOL environment variable.
    #[serde(default)]
    pub debug_single_pool: bool,

    /// Background tasks writing the tail chunks of oversized results.
    ///
    /// Set via GENCACHE_CONTINUATION_WORKERS environment variable.
    #[serde(default = "default_continuation_workers")]
    pub continuation_workers: usize,

    /// Expiry applied to result entries, in seconds. Zero disables expiry.
    ///
    /// Set via GENCACHE_DEFAULT_TTL_SECS environment variable.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Delay between re-reads of an unfinished chunk manifest.
    ///
    /// Set via GENCACHE_POLL_INTERVAL_MS environment variable.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on how long a reader waits for an unfinished manifest.
    ///
    /// Set via GENCACHE_RESULT_WAIT_MS environment variable.
    #[serde(default = "default_result_wait_ms")]
    pub result_wait_ms: u64,

    /// Seconds an unfinished chunk manifest may go without being re-written
    /// before readers treat its writer as gone and recompute.
    ///
    /// Set via GENCACHE_MANIFEST_STALE_SECS environment variable.
    #[serde(default = "default_manifest_stale_secs")]
    pub manifest_stale_secs: u64,

    /// Lazy lookups on an unfinished manifest: `miss` or `wait`.
    ///
    /// Set via GENCACHE_LAZY_IN_PROGRESS environment variable.
    #[serde(default)]
    pub lazy_in_progress: InProgressPolicy,
}

fn default_store_url() -> String {
    "memory://".into()
}

fn default_key_prefix() -> String {
    "genkey".into()
}

fn default_chunk_max_rows() -> usize {
    50_000
}

fn default_chunk_max_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_pool_size() -> usize {
    4
}

fn default_continuation_workers() -> usize {
    4
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_result_wait_ms() -> u64 {
    300_000
}

fn default_manifest_stale_secs() -> u64 {
    600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            key_prefix: default_key_prefix(),
            chunk_max_rows: default_chunk_max_rows(),
            chunk_max_bytes: default_chunk_max_bytes(),
            pool_size: default_pool_size(),
            debug_single_pool: false,
            continuation_workers: default_continuation_workers(),
            default_ttl_secs: default_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            result_wait_ms: default_result_wait_ms(),
            manifest_stale_secs: default_manifest_stale_secs(),
            lazy_in_progress: InProgressPolicy::Miss,
        }
    }
}

impl AppConfig {
    /// Default result expiry, or `None` when expiry is disabled.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_wait(&self) -> Duration {
        Duration::from_millis(self.result_wait_ms)
    }

    pub fn manifest_stale_after(&self) -> Duration {
        Duration::from_secs(self.manifest_stale_secs)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `GENCACHE_`
    /// 2. TOML file from `GENCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("GENCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("GENCACHE_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
