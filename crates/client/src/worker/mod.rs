//! Query execution and chunked result writing.
//!
//! [`QueryWorker::fetch`] runs a query and writes its first chunk before
//! returning. A result that fits in one chunk is stored as a plain matrix.
//! Anything larger is stored as a chunk manifest whose remaining chunks are
//! appended by a continuation running on the worker's background pool. The
//! manifest is re-written after every chunk so readers can follow along.

mod continuation;
mod reader;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use gencache_core::{AppConfig, CacheEntry, CacheProxy, ChunkRef, Error, RawMatrix, ValuesList};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::request::FetchRequest;
use crate::source::SourceRegistry;
use continuation::{Continuation, ContinuationPool};
use reader::ChunkReader;

pub type ExecutionId = u64;

/// Terminal executions kept around for `status` before they are pruned.
const RETAINED_EXECUTIONS: usize = 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub chunk_max_rows: usize,
    pub chunk_max_bytes: usize,
    pub continuation_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { chunk_max_rows: 50_000, chunk_max_bytes: 8 * 1024 * 1024, continuation_workers: 4 }
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            chunk_max_rows: config.chunk_max_rows,
            chunk_max_bytes: config.chunk_max_bytes,
            continuation_workers: config.continuation_workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Completed { rows: u64, chunks: usize },
    Failed(String),
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    fn from_error(error: &Error) -> Self {
        match error {
            Error::Cancelled(_) => ExecutionStatus::Cancelled,
            other => ExecutionStatus::Failed(other.to_string()),
        }
    }
}

pub(crate) struct Execution {
    id: ExecutionId,
    job_id: String,
    key: String,
    cancel: CancellationToken,
    status: watch::Sender<ExecutionStatus>,
}

impl Execution {
    fn finish(&self, status: ExecutionStatus) {
        tracing::debug!(execution = self.id, key = %self.key, ?status, "execution finished");
        self.status.send_replace(status);
    }

    fn current(&self) -> ExecutionStatus {
        self.status.borrow().clone()
    }
}

/// Tracks one execution independently of the worker's registry, which
/// forgets finished executions once it grows large.
pub struct ExecutionHandle {
    execution: Arc<Execution>,
}

impl ExecutionHandle {
    pub fn id(&self) -> ExecutionId {
        self.execution.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.current()
    }

    /// Wait until the execution reaches a terminal state.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.execution.status.subscribe();
        let status = rx.wait_for(ExecutionStatus::is_terminal).await.map(|status| status.clone());
        status.unwrap_or_else(|_| self.execution.current())
    }
}

/// Counts one unit of in-flight work until dropped.
pub(crate) struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store `entry` and re-apply the expiry, which a put clears.
pub(crate) async fn write_entry(
    proxy: &CacheProxy, key: &str, entry: &CacheEntry, ttl: Option<Duration>,
) -> Result<(), Error> {
    proxy.put(key, entry).await?;
    if let Some(ttl) = ttl {
        proxy.expire(key, ttl).await?;
    }
    Ok(())
}

/// Executes queries against registered sources and writes their results.
///
/// Must be created inside a tokio runtime: the continuation pool is spawned
/// on construction.
pub struct QueryWorker {
    proxy: CacheProxy,
    sources: Arc<SourceRegistry>,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
    next_id: AtomicU64,
    executions: DashMap<ExecutionId, Arc<Execution>>,
    pool: ContinuationPool,
}

impl QueryWorker {
    pub fn new(proxy: CacheProxy, sources: Arc<SourceRegistry>, config: WorkerConfig) -> Self {
        let pool = ContinuationPool::spawn(config.continuation_workers);
        Self {
            proxy,
            sources,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            executions: DashMap::new(),
            pool,
        }
    }

    /// Run `request` and write its first chunk.
    ///
    /// Returns once the key holds either the complete matrix or a manifest
    /// with at least one chunk. In the latter case the rest of the result is
    /// written in the background; follow it with [`QueryWorker::wait`].
    pub async fn fetch(&self, request: &FetchRequest) -> Result<ExecutionId, Error> {
        self.execute(request).await.map(|handle| handle.id())
    }

    /// Like [`QueryWorker::fetch`], returning a handle that stays usable
    /// after the execution is pruned from the registry.
    pub async fn execute(&self, request: &FetchRequest) -> Result<ExecutionHandle, Error> {
        let guard = InFlightGuard::enter(&self.in_flight);
        let execution = self.register(request);
        tracing::info!(
            execution = execution.id,
            key = %request.key,
            job_id = %request.job_id,
            source = %request.source.pool_key(),
            dependencies = ?request.dependencies,
            "executing query"
        );

        match self.start(request, &execution, guard).await {
            Ok(()) => Ok(ExecutionHandle { execution }),
            Err(e) => {
                tracing::warn!(execution = execution.id, key = %request.key, error = %e, "query failed");
                execution.finish(ExecutionStatus::from_error(&e));
                Err(e)
            }
        }
    }

    async fn start(&self, request: &FetchRequest, execution: &Arc<Execution>, guard: InFlightGuard) -> Result<(), Error> {
        let source = self.sources.get_or_connect(&request.source).await?;
        let cursor = tokio::select! {
            biased;
            _ = execution.cancel.cancelled() => return Err(Error::Cancelled(request.key.clone())),
            cursor = source.execute(&request.sql) => cursor?,
        };

        let mut reader =
            ChunkReader::new(cursor, self.config.chunk_max_rows, self.config.chunk_max_bytes, request.limit);
        let (columns, column_types) = reader.columns();

        let first = match reader.next_chunk(&execution.cancel).await {
            Ok(rows) => rows,
            Err(e) => {
                reader.close().await;
                return Err(e);
            }
        };

        if reader.exhausted {
            reader.close().await;
            let mut matrix = RawMatrix::new(columns, column_types, first);
            matrix.has_more = reader.truncated;
            let rows = matrix.len() as u64;
            write_entry(&self.proxy, &request.key, &CacheEntry::Matrix(matrix), request.ttl).await?;
            drop(guard);
            execution.finish(ExecutionStatus::Completed { rows, chunks: 1 });
            return Ok(());
        }

        let chunk = ChunkRef::new(&request.key, 0, first.len() as u64);
        let mut matrix = RawMatrix::new(columns.clone(), column_types.clone(), first);
        matrix.has_more = true;
        let mut list = ValuesList::default();

        if let Err(e) = self.write_first_chunk(request, chunk, matrix, &mut list).await {
            reader.close().await;
            return Err(e);
        }

        tracing::debug!(execution = execution.id, key = %request.key, "result exceeds one chunk, continuing in background");
        self.pool
            .submit(Continuation {
                proxy: self.proxy.clone(),
                key: request.key.clone(),
                ttl: request.ttl,
                columns,
                column_types,
                reader,
                list,
                execution: execution.clone(),
                guard: Some(guard),
            })
            .await;
        Ok(())
    }

    async fn write_first_chunk(
        &self, request: &FetchRequest, chunk: ChunkRef, matrix: RawMatrix, list: &mut ValuesList,
    ) -> Result<(), Error> {
        write_entry(&self.proxy, &chunk.key, &CacheEntry::Matrix(matrix), request.ttl).await?;
        list.push(chunk);
        list.touch();
        write_entry(&self.proxy, &request.key, &CacheEntry::ValuesList(list.clone()), request.ttl).await
    }

    fn register(&self, request: &FetchRequest) -> Arc<Execution> {
        if self.executions.len() >= RETAINED_EXECUTIONS {
            self.executions.retain(|_, execution| !execution.current().is_terminal());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (status, _) = watch::channel(ExecutionStatus::Running);
        let execution = Arc::new(Execution {
            id,
            job_id: request.job_id.clone(),
            key: request.key.clone(),
            cancel: CancellationToken::new(),
            status,
        });
        self.executions.insert(id, execution.clone());
        execution
    }

    /// Request cancellation of one execution. Returns false if it is unknown
    /// or already finished.
    pub fn cancel(&self, id: ExecutionId) -> bool {
        match self.executions.get(&id) {
            Some(execution) if !execution.current().is_terminal() => {
                execution.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every running execution started for `job_id`.
    pub fn cancel_job(&self, job_id: &str) -> usize {
        let mut cancelled = 0;
        for execution in self.executions.iter() {
            if execution.job_id == job_id && !execution.current().is_terminal() {
                execution.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(job_id, cancelled, "cancelled job executions");
        }
        cancelled
    }

    /// Cancellation handle of an execution, for external job management.
    pub fn cancel_handle(&self, id: ExecutionId) -> Option<CancellationToken> {
        self.executions.get(&id).map(|execution| execution.cancel.clone())
    }

    pub fn status(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        self.executions.get(&id).map(|execution| execution.current())
    }

    /// Wait until the execution reaches a terminal state.
    pub async fn wait(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        let mut rx = {
            let execution = self.executions.get(&id)?;
            execution.status.subscribe()
        };
        let status = rx.wait_for(ExecutionStatus::is_terminal).await.ok()?.clone();
        Some(status)
    }

    /// Executions and continuations that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
