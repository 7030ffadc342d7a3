//! Single-flight fetch coordination.
//!
//! Every key has at most one execution in flight per process. The first
//! caller for a missing key spawns the execution and registers it; later
//! callers await the same shared future. The execution task removes its own
//! registry entry when it finishes, successful or not, so a failure is never
//! cached in memory. Lazy callers are the exception: they cannot wait for the
//! outcome, so a failure of an execution they started or joined is kept in a
//! bounded log and reported to the next lazy call for that key.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use gencache_core::{AppConfig, CacheProxy, EntryStatus, Error, InProgressPolicy, RawMatrix};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::request::FetchRequest;
use crate::worker::{ExecutionStatus, QueryWorker};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Concurrent executions per source.
    pub pool_size: usize,
    /// Run every source through one pool.
    pub debug_single_pool: bool,
    pub lazy_in_progress: InProgressPolicy,
    /// How long a lazy caller's failure stays reportable.
    pub failure_retention: Duration,
    /// Most failures kept for lazy callers.
    pub failure_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            debug_single_pool: false,
            lazy_in_progress: InProgressPolicy::Miss,
            failure_retention: Duration::from_secs(600),
            failure_capacity: 1024,
        }
    }
}

impl From<&AppConfig> for CoordinatorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            debug_single_pool: config.debug_single_pool,
            lazy_in_progress: config.lazy_in_progress,
            ..Self::default()
        }
    }
}

/// What waiters of a shared execution receive when it fails.
#[derive(Debug, Clone)]
enum Failure {
    Cancelled(String),
    Failed(String),
}

impl Failure {
    fn new(error: &Error) -> Self {
        match error {
            Error::Cancelled(reason) => Failure::Cancelled(reason.clone()),
            Error::ComputationFailed { reason, .. } => Failure::Failed(reason.clone()),
            other => Failure::Failed(other.to_string()),
        }
    }

    fn into_error(self, key: &str) -> Error {
        match self {
            Failure::Cancelled(reason) => Error::Cancelled(reason),
            Failure::Failed(reason) => Error::ComputationFailed { key: key.to_string(), reason },
        }
    }
}

type SharedExecution = Shared<BoxFuture<'static, Result<RawMatrix, Failure>>>;

struct PendingExecution {
    id: u64,
    result: SharedExecution,
    /// Set once a lazy caller is interested in the outcome.
    report_failure: Arc<AtomicBool>,
}

struct RecordedFailure {
    reason: String,
    at: Instant,
}

/// Failures awaiting a lazy caller, bounded in age and count.
struct FailureLog {
    entries: DashMap<String, RecordedFailure>,
    retention: Duration,
    capacity: usize,
}

impl FailureLog {
    fn new(retention: Duration, capacity: usize) -> Self {
        Self { entries: DashMap::new(), retention, capacity: capacity.max(1) }
    }

    fn record(&self, key: &str, reason: String) {
        if self.entries.len() >= self.capacity {
            self.entries.retain(|_, failure| failure.at.elapsed() < self.retention);
        }
        if self.entries.len() >= self.capacity {
            let oldest = self.entries.iter().min_by_key(|failure| failure.at).map(|failure| failure.key().clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key.to_string(), RecordedFailure { reason, at: Instant::now() });
    }

    /// Remove the failure for `key`, returning it if still within retention.
    fn take(&self, key: &str) -> Option<String> {
        let (_, failure) = self.entries.remove(key)?;
        (failure.at.elapsed() < self.retention).then_some(failure.reason)
    }

    fn forget(&self, key: &str) {
        self.entries.remove(key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Removes a registry entry when the execution task ends, including by panic.
struct PendingSlot {
    pending: Arc<DashMap<String, PendingExecution>>,
    key: String,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.remove_if(&self.key, |_, execution| execution.id == self.id);
    }
}

/// Execution pools keyed by source identity.
struct Pools {
    size: usize,
    shared: Option<Arc<Semaphore>>,
    per_source: DashMap<String, Arc<Semaphore>>,
}

impl Pools {
    fn new(size: usize, debug_single_pool: bool) -> Self {
        let size = size.max(1);
        Self {
            size,
            shared: debug_single_pool.then(|| Arc::new(Semaphore::new(size))),
            per_source: DashMap::new(),
        }
    }

    fn for_source(&self, pool_key: &str) -> Arc<Semaphore> {
        if let Some(shared) = &self.shared {
            return shared.clone();
        }
        self.per_source
            .entry(pool_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.size)))
            .clone()
    }
}

pub struct FetchCoordinator {
    proxy: CacheProxy,
    worker: Arc<QueryWorker>,
    pools: Pools,
    policy: InProgressPolicy,
    next_id: AtomicU64,
    pending: Arc<DashMap<String, PendingExecution>>,
    /// Last failure per key, reported once by lazy fetches.
    failures: Arc<FailureLog>,
}

impl FetchCoordinator {
    pub fn new(proxy: CacheProxy, worker: Arc<QueryWorker>, config: CoordinatorConfig) -> Self {
        if config.debug_single_pool {
            tracing::warn!("all sources share one execution pool");
        }
        Self {
            proxy,
            worker,
            pools: Pools::new(config.pool_size, config.debug_single_pool),
            policy: config.lazy_in_progress,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            failures: Arc::new(FailureLog::new(config.failure_retention, config.failure_capacity)),
        }
    }

    /// Return the cached result for `request.key`, computing it if needed.
    ///
    /// Concurrent callers for the same key share one execution and all see
    /// its result or its failure. A stored result marked as failed is
    /// recomputed and overwritten.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<RawMatrix, Error> {
        match self.proxy.status(&request.key).await? {
            EntryStatus::Ready => match self.hit(&request.key).await {
                Err(Error::CacheMiss(missing)) => {
                    tracing::debug!(key = %request.key, %missing, "entry expired while reading, recomputing");
                }
                other => return other,
            },
            EntryStatus::InProgress if !self.pending.contains_key(&request.key) => {
                // Written by another process; follow it unless the writer gives up.
                match self.hit(&request.key).await {
                    Err(e @ (Error::CacheMiss(_) | Error::ComputationFailed { .. })) => {
                        tracing::debug!(key = %request.key, error = %e, "foreign write did not finish, recomputing");
                    }
                    other => return other,
                }
            }
            EntryStatus::InProgress | EntryStatus::Missing | EntryStatus::Failed => {}
        }

        self.join_or_start(request, false).await.map_err(|failure| failure.into_error(&request.key))
    }

    /// Like [`FetchCoordinator::fetch`] but never waits for a computation.
    ///
    /// Starts (or joins) the execution in the background and returns
    /// `NotReady`. A failure of the last background execution is returned
    /// once as `ComputationFailed`.
    pub async fn fetch_lazy(&self, request: &FetchRequest) -> Result<RawMatrix, Error> {
        if let Some(reason) = self.failures.take(&request.key) {
            return Err(Error::ComputationFailed { key: request.key.clone(), reason });
        }

        match self.proxy.status(&request.key).await? {
            EntryStatus::Ready => return self.hit(&request.key).await,
            EntryStatus::InProgress if self.policy == InProgressPolicy::Wait => return self.hit(&request.key).await,
            EntryStatus::Failed if !self.pending.contains_key(&request.key) => {
                // Report the stored failure and start over in the background.
                drop(self.join_or_start(request, true));
                return Err(Error::ComputationFailed {
                    key: request.key.clone(),
                    reason: "stored result is marked as failed".into(),
                });
            }
            EntryStatus::InProgress | EntryStatus::Missing | EntryStatus::Failed => {}
        }

        drop(self.join_or_start(request, true));
        Err(Error::NotReady(request.key.clone()))
    }

    /// Executions currently registered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn hit(&self, key: &str) -> Result<RawMatrix, Error> {
        let matrix = self.proxy.get_result(key).await?;
        tracing::debug!(key, rows = matrix.len(), "cache hit");
        Ok(matrix)
    }

    /// `lazy` callers do not wait for the outcome; a failure is logged for them.
    fn join_or_start(&self, request: &FetchRequest, lazy: bool) -> SharedExecution {
        match self.pending.entry(request.key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(key = %request.key, "joining in-flight execution");
                if lazy {
                    entry.get().report_failure.store(true, Ordering::SeqCst);
                }
                entry.get().result.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let report_failure = Arc::new(AtomicBool::new(lazy));
                let result = self.spawn_execution(id, request.clone(), report_failure.clone());
                entry.insert(PendingExecution { id, result: result.clone(), report_failure });
                result
            }
        }
    }

    fn spawn_execution(&self, id: u64, request: FetchRequest, report_failure: Arc<AtomicBool>) -> SharedExecution {
        let slot = PendingSlot { pending: self.pending.clone(), key: request.key.clone(), id };
        let worker = self.worker.clone();
        let proxy = self.proxy.clone();
        let failures = self.failures.clone();
        let pool = self.pools.for_source(&request.source.pool_key());

        let handle = tokio::spawn(async move {
            let outcome = execute(&worker, &proxy, &pool, &request).await;
            match &outcome {
                Ok(matrix) => {
                    failures.forget(&request.key);
                    tracing::info!(key = %request.key, rows = matrix.len(), "computed result");
                }
                Err(e) => {
                    tracing::warn!(key = %request.key, error = %e, "computation failed");
                    if report_failure.load(Ordering::SeqCst) {
                        failures.record(&request.key, e.to_string());
                    }
                }
            }
            drop(slot);
            outcome.map_err(|e| Failure::new(&e))
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Failure::Failed(format!("execution task aborted: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn execute(
    worker: &QueryWorker, proxy: &CacheProxy, pool: &Semaphore, request: &FetchRequest,
) -> Result<RawMatrix, Error> {
    let handle = {
        let _permit = pool
            .acquire()
            .await
            .map_err(|_| Error::Execution("execution pool closed".into()))?;
        worker.execute(request).await?
    };

    match handle.wait().await {
        ExecutionStatus::Completed { .. } => {}
        ExecutionStatus::Cancelled => return Err(Error::Cancelled(request.key.clone())),
        ExecutionStatus::Failed(reason) => return Err(Error::Execution(reason)),
        ExecutionStatus::Running => {
            return Err(Error::Execution(format!("execution {} stopped without a result", handle.id())));
        }
    }

    let matrix = proxy.get_result(&request.key).await?;
    Ok(matrix.tagged(&request.key, false))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::source::memory::{CannedResult, MemoryConnector, MemorySource};
    use crate::source::{SourceDescriptor, SourceRegistry};
    use crate::worker::WorkerConfig;
    use gencache_core::{CacheEntry, ChunkRef, MemoryStore, ProxyConfig, Row, ValuesList, Value};

    fn rows(n: i64) -> Vec<Row> {
        (0..n).map(|i| vec![Value::Int(i)]).collect()
    }

    struct Harness {
        coordinator: Arc<FetchCoordinator>,
        proxy: CacheProxy,
        source: Arc<MemorySource>,
    }

    fn harness(source: MemorySource, chunk_max_rows: usize, policy: InProgressPolicy) -> Harness {
        let config = CoordinatorConfig { lazy_in_progress: policy, ..CoordinatorConfig::default() };
        harness_with(source, chunk_max_rows, config)
    }

    fn harness_with(source: MemorySource, chunk_max_rows: usize, config: CoordinatorConfig) -> Harness {
        let source = Arc::new(source);
        let proxy = CacheProxy::new(
            Arc::new(MemoryStore::new()),
            ProxyConfig {
                poll_interval: Duration::from_millis(5),
                result_wait: Duration::from_secs(5),
                ..ProxyConfig::default()
            },
        );
        let registry = Arc::new(SourceRegistry::new(Arc::new(MemoryConnector::new(source.clone()))));
        let worker = Arc::new(QueryWorker::new(
            proxy.clone(),
            registry,
            WorkerConfig { chunk_max_rows, chunk_max_bytes: usize::MAX, continuation_workers: 2 },
        ));
        Harness { coordinator: Arc::new(FetchCoordinator::new(proxy.clone(), worker, config)), proxy, source }
    }

    fn request(key: &str, sql: &str) -> FetchRequest {
        FetchRequest::new(key, sql, SourceDescriptor::new("mem://db", "u", "p"))
    }

    async fn wait_idle(coordinator: &FetchCoordinator) {
        for _ in 0..500 {
            if coordinator.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution never finished");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_execution() {
        let source = MemorySource::new()
            .with_execute_delay(Duration::from_millis(50))
            .with_result("q", CannedResult::new(&["n"], rows(8)));
        let h = harness(source, 100, InProgressPolicy::Miss);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let coordinator = h.coordinator.clone();
            tasks.push(tokio::spawn(async move { coordinator.fetch(&request("k", "q")).await }));
        }
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.rows, rows(8));
            assert!(!result.from_cache);
        }
        assert_eq!(h.source.executions(), 1);
        assert_eq!(h.coordinator.pending(), 0);

        let cached = h.coordinator.fetch(&request("k", "q")).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.key.as_deref(), Some("k"));
        assert_eq!(h.source.executions(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_shared_then_retried() {
        let failing = CannedResult::new(&["n"], rows(5)).failing_after(0);
        let source = MemorySource::new().with_execute_delay(Duration::from_millis(30)).with_result("q", failing);
        let h = harness(source, 100, InProgressPolicy::Miss);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coordinator = h.coordinator.clone();
            tasks.push(tokio::spawn(async move { coordinator.fetch(&request("k", "q")).await }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::ComputationFailed { ref key, .. } if key == "k"));
        }
        assert_eq!(h.source.executions(), 1);
        assert_eq!(h.coordinator.pending(), 0);

        h.source.insert("q", CannedResult::new(&["n"], rows(5)));
        let result = h.coordinator.fetch(&request("k", "q")).await.unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(h.source.executions(), 2);
    }

    #[tokio::test]
    async fn test_chunked_equals_unchunked() {
        for limit in [None, Some(33)] {
            let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(57)));
            let chunked = harness(source, 10, InProgressPolicy::Miss);
            let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(57)));
            let whole = harness(source, 1_000, InProgressPolicy::Miss);

            let a = chunked.coordinator.fetch(&request("k", "q").with_limit(limit)).await.unwrap();
            let b = whole.coordinator.fetch(&request("k", "q").with_limit(limit)).await.unwrap();
            assert_eq!(a.rows, b.rows);
            assert_eq!(a.columns, b.columns);
            assert_eq!(a.column_types, b.column_types);
            assert_eq!(a.has_more, b.has_more);
            assert_eq!(a.has_more, limit.is_some());
            assert!(matches!(chunked.proxy.get("k").await.unwrap(), Some(CacheEntry::ValuesList(_))));
            assert!(matches!(whole.proxy.get("k").await.unwrap(), Some(CacheEntry::Matrix(_))));
        }
    }

    #[tokio::test]
    async fn test_non_finite_floats_cached() {
        let values = vec![vec![Value::Float(f64::INFINITY)], vec![Value::Float(f64::NEG_INFINITY)]];
        let source = MemorySource::new().with_result("q", CannedResult::new(&["x"], values.clone()));
        let h = harness(source, 100, InProgressPolicy::Miss);

        assert_eq!(h.coordinator.fetch(&request("k", "q")).await.unwrap().rows, values);
        let cached = h.coordinator.fetch(&request("k", "q")).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.rows, values);
        assert_eq!(h.source.executions(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_manifest_is_recomputed() {
        let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(3)));
        let h = harness(source, 100, InProgressPolicy::Miss);
        let chunk = ChunkRef::new("k", 0, 1);
        let part = RawMatrix::new(vec!["n".into()], vec!["INTEGER".into()], rows(1));
        h.proxy.put(&chunk.key, &CacheEntry::Matrix(part)).await.unwrap();
        let mut list = ValuesList::default();
        list.push(chunk);
        h.proxy.put("k", &CacheEntry::ValuesList(list)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(h.coordinator.fetch(&request("k", "q")).await.unwrap().rows, rows(3));
        }
        assert_eq!(h.source.executions(), 1);
        assert!(matches!(h.proxy.get("k").await.unwrap(), Some(CacheEntry::Matrix(_))));
    }

    #[tokio::test]
    async fn test_missing_chunk_is_recomputed() {
        let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(4)));
        let h = harness(source, 100, InProgressPolicy::Miss);
        let mut list = ValuesList::default();
        list.push(ChunkRef::new("k", 0, 4));
        list.done = true;
        h.proxy.put("k", &CacheEntry::ValuesList(list)).await.unwrap();
        assert_eq!(h.proxy.status("k").await.unwrap(), EntryStatus::Ready);

        assert_eq!(h.coordinator.fetch(&request("k", "q")).await.unwrap().rows, rows(4));
        assert_eq!(h.source.executions(), 1);
    }

    #[tokio::test]
    async fn test_failed_manifest_is_recomputed() {
        let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(3)));
        let h = harness(source, 100, InProgressPolicy::Miss);
        let list = ValuesList { error: true, ..ValuesList::default() };
        h.proxy.put("k", &CacheEntry::ValuesList(list)).await.unwrap();

        let result = h.coordinator.fetch(&request("k", "q")).await.unwrap();
        assert_eq!(result.len(), 3);
        assert!(matches!(h.proxy.get("k").await.unwrap(), Some(CacheEntry::Matrix(_))));
    }

    #[tokio::test]
    async fn test_lazy_starts_in_background() {
        let source = MemorySource::new()
            .with_execute_delay(Duration::from_millis(20))
            .with_result("q", CannedResult::new(&["n"], rows(4)));
        let h = harness(source, 100, InProgressPolicy::Miss);

        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;

        let result = h.coordinator.fetch_lazy(&request("k", "q")).await.unwrap();
        assert_eq!(result.len(), 4);
        assert!(result.from_cache);
        assert_eq!(h.source.executions(), 1);
    }

    #[tokio::test]
    async fn test_compute_failure_not_reported_to_lazy() {
        let failing = CannedResult::new(&["n"], rows(2)).failing_after(0);
        let h = harness(MemorySource::new().with_result("q", failing), 100, InProgressPolicy::Miss);

        assert!(matches!(h.coordinator.fetch(&request("k", "q")).await, Err(Error::ComputationFailed { .. })));
        assert_eq!(h.coordinator.failures.len(), 0);
        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;
    }

    #[tokio::test]
    async fn test_lazy_failures_bounded() {
        let failing = CannedResult::new(&["n"], rows(2)).failing_after(0);
        let config = CoordinatorConfig { failure_capacity: 2, ..CoordinatorConfig::default() };
        let h = harness_with(MemorySource::new().with_result("q", failing), 100, config);

        for i in 0..5 {
            let _ = h.coordinator.fetch_lazy(&request(&format!("k{i}"), "q")).await;
            wait_idle(&h.coordinator).await;
        }
        assert_eq!(h.coordinator.failures.len(), 2);
        assert!(matches!(h.coordinator.fetch_lazy(&request("k0", "q")).await, Err(Error::NotReady(_))));
        assert!(matches!(h.coordinator.fetch_lazy(&request("k4", "q")).await, Err(Error::ComputationFailed { .. })));
        wait_idle(&h.coordinator).await;
    }

    #[tokio::test]
    async fn test_lazy_failure_expires() {
        let failing = CannedResult::new(&["n"], rows(2)).failing_after(0);
        let config = CoordinatorConfig { failure_retention: Duration::from_millis(20), ..CoordinatorConfig::default() };
        let h = harness_with(MemorySource::new().with_result("q", failing), 100, config);

        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;
    }

    #[tokio::test]
    async fn test_lazy_reports_failure_once() {
        let failing = CannedResult::new(&["n"], rows(2)).failing_after(0);
        let h = harness(MemorySource::new().with_result("q", failing), 100, InProgressPolicy::Miss);

        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;

        assert!(matches!(
            h.coordinator.fetch_lazy(&request("k", "q")).await,
            Err(Error::ComputationFailed { .. })
        ));
        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;
        assert_eq!(h.source.executions(), 2);
    }

    async fn put_in_progress(proxy: &CacheProxy) -> ValuesList {
        let chunk = ChunkRef::new("k", 0, 2);
        let mut part = RawMatrix::new(vec!["n".into()], vec!["INTEGER".into()], rows(2));
        part.has_more = true;
        proxy.put(&chunk.key, &CacheEntry::Matrix(part)).await.unwrap();
        let mut list = ValuesList::default();
        list.push(chunk);
        list.touch();
        proxy.put("k", &CacheEntry::ValuesList(list.clone())).await.unwrap();
        list
    }

    #[tokio::test]
    async fn test_lazy_in_progress_wait_policy() {
        let h = harness(MemorySource::new(), 100, InProgressPolicy::Wait);
        let mut list = put_in_progress(&h.proxy).await;

        let proxy = h.proxy.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let chunk = ChunkRef::new("k", 2, 3);
            let part = RawMatrix::new(vec!["n".into()], vec!["INTEGER".into()], vec![vec![Value::Int(2)]]);
            proxy.put(&chunk.key, &CacheEntry::Matrix(part)).await.unwrap();
            list.push(chunk);
            list.done = true;
            proxy.put("k", &CacheEntry::ValuesList(list)).await.unwrap();
        });

        let result = h.coordinator.fetch_lazy(&request("k", "q")).await.unwrap();
        writer.await.unwrap();
        assert_eq!(result.rows, rows(3));
        assert_eq!(h.source.executions(), 0);
    }

    #[tokio::test]
    async fn test_lazy_in_progress_miss_policy() {
        let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows(3)));
        let h = harness(source, 100, InProgressPolicy::Miss);
        put_in_progress(&h.proxy).await;

        assert!(matches!(h.coordinator.fetch_lazy(&request("k", "q")).await, Err(Error::NotReady(_))));
        wait_idle(&h.coordinator).await;
        assert_eq!(h.source.executions(), 1);
        assert_eq!(h.coordinator.fetch_lazy(&request("k", "q")).await.unwrap().len(), 3);
    }

    #[test]
    fn test_pools_per_source_and_shared() {
        let pools = Pools::new(2, false);
        let a = pools.for_source("u@db1");
        assert!(Arc::ptr_eq(&a, &pools.for_source("u@db1")));
        assert!(!Arc::ptr_eq(&a, &pools.for_source("u@db2")));
        assert_eq!(a.available_permits(), 2);

        let debug = Pools::new(2, true);
        assert!(Arc::ptr_eq(&debug.for_source("u@db1"), &debug.for_source("u@db2")));
    }
}
