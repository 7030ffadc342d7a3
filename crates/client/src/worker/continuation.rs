//! Background completion of chunked results.

use std::sync::Arc;
use std::time::Duration;

use gencache_core::{CacheEntry, CacheProxy, ChunkRef, Error, RawMatrix, ValuesList};
use tokio::sync::{Mutex, mpsc};

use super::reader::ChunkReader;
use super::{Execution, ExecutionStatus, InFlightGuard, write_entry};

const QUEUE_DEPTH: usize = 1024;

/// The unfinished tail of one execution.
pub(crate) struct Continuation {
    pub proxy: CacheProxy,
    pub key: String,
    pub ttl: Option<Duration>,
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub reader: ChunkReader,
    pub list: ValuesList,
    pub execution: Arc<Execution>,
    pub guard: Option<InFlightGuard>,
}

impl Continuation {
    async fn run(mut self) {
        let outcome = self.drive().await;
        self.reader.close().await;
        // in_flight drops before waiters are woken.
        let guard = self.guard.take();

        match outcome {
            Ok(rows) => {
                tracing::info!(
                    execution = self.execution.id,
                    key = %self.key,
                    rows,
                    chunks = self.list.chunks.len(),
                    "chunked result complete"
                );
                drop(guard);
                self.execution.finish(ExecutionStatus::Completed { rows, chunks: self.list.chunks.len() });
            }
            Err(e) => {
                tracing::warn!(execution = self.execution.id, key = %self.key, error = %e, "chunked result abandoned");
                self.list.error = true;
                self.list.touch();
                let entry = CacheEntry::ValuesList(self.list.clone());
                if let Err(write_err) = write_entry(&self.proxy, &self.key, &entry, self.ttl).await {
                    tracing::error!(key = %self.key, error = %write_err, "could not mark manifest as failed");
                }
                drop(guard);
                self.execution.finish(ExecutionStatus::from_error(&e));
            }
        }
    }

    /// Append chunks until the reader is exhausted; returns the total row count.
    async fn drive(&mut self) -> Result<u64, Error> {
        let cancel = self.execution.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("{} after {} chunks", self.key, self.list.chunks.len())));
            }

            let rows = self.reader.next_chunk(&cancel).await?;
            if !rows.is_empty() {
                let lower = self.list.row_count();
                let chunk = ChunkRef::new(&self.key, lower, lower + rows.len() as u64);
                let mut matrix = RawMatrix::new(self.columns.clone(), self.column_types.clone(), rows);
                matrix.has_more = !self.reader.exhausted || self.reader.truncated;
                write_entry(&self.proxy, &chunk.key, &CacheEntry::Matrix(matrix), self.ttl).await?;
                tracing::trace!(chunk = %chunk.key, "wrote chunk");
                self.list.push(chunk);
            }

            self.list.done = self.reader.exhausted;
            self.list.touch();
            write_entry(&self.proxy, &self.key, &CacheEntry::ValuesList(self.list.clone()), self.ttl).await?;
            if self.list.done {
                return Ok(self.list.row_count());
            }
        }
    }
}

/// Fixed set of tasks draining a shared queue of continuations.
pub(crate) struct ContinuationPool {
    tx: mpsc::Sender<Continuation>,
}

impl ContinuationPool {
    pub fn spawn(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Continuation>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(continuation) => continuation.run().await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "continuation worker stopped");
            });
        }

        Self { tx }
    }

    pub async fn submit(&self, continuation: Continuation) {
        if let Err(mpsc::error::SendError(continuation)) = self.tx.send(continuation).await {
            tracing::warn!(key = %continuation.key, "continuation pool closed, running detached");
            tokio::spawn(continuation.run());
        }
    }
}
