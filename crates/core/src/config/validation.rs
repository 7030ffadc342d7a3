//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `store_url` has no recognised scheme
    /// - `key_prefix` is empty
    /// - a chunk limit, pool size or worker count is 0
    /// - `poll_interval_ms` exceeds `result_wait_ms`
    /// - `manifest_stale_secs` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        const SCHEMES: &[&str] = &["memory://", "sqlite://", "sqlite::memory:", "redis://", "rediss://"];
        if !SCHEMES.iter().any(|scheme| self.store_url.starts_with(scheme)) {
            return Err(ConfigError::Invalid {
                field: "store_url".into(),
                reason: format!("unsupported scheme in {}", self.store_url),
            });
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid { field: "key_prefix".into(), reason: "must not be empty".into() });
        }

        if self.chunk_max_rows == 0 {
            return Err(ConfigError::Invalid { field: "chunk_max_rows".into(), reason: "must be greater than 0".into() });
        }
        if self.chunk_max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_max_bytes".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.chunk_max_bytes > 512 * 1024 * 1024 {
            return Err(ConfigError::Invalid { field: "chunk_max_bytes".into(), reason: "must not exceed 512MB".into() });
        }

        if self.pool_size == 0 {
            return Err(ConfigError::Invalid { field: "pool_size".into(), reason: "must be greater than 0".into() });
        }
        if self.continuation_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "continuation_workers".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.poll_interval_ms == 0 || self.poll_interval_ms > self.result_wait_ms {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms".into(),
                reason: "must be between 1 and result_wait_ms".into(),
            });
        }

        if self.manifest_stale_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "manifest_stale_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.debug_single_pool {
            tracing::warn!(pool_size = self.pool_size, "debug_single_pool is set; all sources share one pool");
        }

        Ok(())
    }
}
