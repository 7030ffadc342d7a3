//! Client side of gencache.
//!
//! This crate provides query sources, the chunking query worker, single-flight
//! fetch coordination, and the [`CacheEngine`] that ties them to a backing
//! store.

pub mod coordinator;
pub mod engine;
pub mod request;
pub mod source;
pub mod worker;

pub use coordinator::{CoordinatorConfig, FetchCoordinator};
pub use engine::{CacheEngine, CachedQuery, Fetched};
pub use request::FetchRequest;
pub use source::{
    CannedResult, ColumnMeta, MemoryConnector, MemorySource, QuerySource, RowCursor, SourceConnector, SourceDescriptor,
    SourceRegistry, SqliteConnector,
};
pub use worker::{ExecutionHandle, ExecutionId, ExecutionStatus, QueryWorker, WorkerConfig};
