//! Source databases, consumed as an opaque "execute SQL, get a row cursor"
//! capability.
//!
//! A [`SourceConnector`] turns a [`SourceDescriptor`] into a [`QuerySource`];
//! the [`SourceRegistry`] keeps one source per descriptor so that connection
//! pools are shared by every query against the same database.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gencache_core::{Error, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub use memory::{CannedResult, MemoryConnector, MemorySource};
pub use sqlite::SqliteConnector;

/// Where a query runs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self { url: url.into(), user: user.into(), password: password.into() }
    }

    /// Identity used to pick an execution pool; never contains the password.
    pub fn pool_key(&self) -> String {
        format!("{}@{}", self.user, self.url)
    }
}

impl std::fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

/// Open result set of one execution.
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[ColumnMeta];

    /// Next row, or `None` once the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>, Error>;

    /// Release the execution. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait QuerySource: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Box<dyn RowCursor>, Error>;
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn QuerySource>, Error>;
}

/// Lazily created, cached sources keyed by `(url, user, password)`.
pub struct SourceRegistry {
    connector: Arc<dyn SourceConnector>,
    sources: Mutex<HashMap<SourceDescriptor, Arc<dyn QuerySource>>>,
}

impl SourceRegistry {
    pub fn new(connector: Arc<dyn SourceConnector>) -> Self {
        Self { connector, sources: Mutex::new(HashMap::new()) }
    }

    /// Source for `descriptor`, connecting on first use.
    pub async fn get_or_connect(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn QuerySource>, Error> {
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.get(descriptor) {
            return Ok(source.clone());
        }

        let source = self.connector.connect(descriptor).await?;
        tracing::info!(url = %descriptor.url, user = %descriptor.user, "connected query source");
        sources.insert(descriptor.clone(), source.clone());
        Ok(source)
    }

    pub async fn len(&self) -> usize {
        self.sources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let descriptor = SourceDescriptor::new("sqlite://db", "analyst", "hunter2");
        let debug = format!("{descriptor:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("analyst"));
        assert!(!descriptor.pool_key().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_registry_caches_per_descriptor() {
        let source = Arc::new(MemorySource::new());
        let registry = SourceRegistry::new(Arc::new(MemoryConnector::new(source)));

        let a = SourceDescriptor::new("mem://a", "u", "p");
        let b = SourceDescriptor::new("mem://a", "u", "other");

        registry.get_or_connect(&a).await.unwrap();
        registry.get_or_connect(&a).await.unwrap();
        assert_eq!(registry.len().await, 1);

        registry.get_or_connect(&b).await.unwrap();
        assert_eq!(registry.len().await, 2);
    }
}
