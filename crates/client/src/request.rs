//! Per-call fetch request.

use std::time::Duration;

use crate::source::SourceDescriptor;

/// Everything needed to compute one cache entry. Never persisted.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Storage key the result is written under.
    pub key: String,
    pub sql: String,
    /// Dependency names the key was derived from; carried for logging.
    pub dependencies: Vec<String>,
    pub source: SourceDescriptor,
    /// Expiry applied to every entry written for this request.
    pub ttl: Option<Duration>,
    /// Stop reading the source after this many rows.
    pub limit: Option<u64>,
    /// Correlation id of the job that asked for this result.
    pub job_id: String,
}

impl FetchRequest {
    pub fn new(key: impl Into<String>, sql: impl Into<String>, source: SourceDescriptor) -> Self {
        Self {
            key: key.into(),
            sql: sql.into(),
            dependencies: Vec::new(),
            source,
            ttl: None,
            limit: None,
            job_id: String::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }
}
