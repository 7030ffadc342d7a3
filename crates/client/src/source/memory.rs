//! In-memory query source for offline use and tests.
//!
//! Results are registered per SQL text. The source counts executions and open
//! cursors, and can be told to fail part-way through a result or to slow down
//! so that concurrent behaviour can be observed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gencache_core::{Error, Row};

use super::{ColumnMeta, QuerySource, RowCursor, SourceConnector, SourceDescriptor};

/// A registered result set.
#[derive(Debug, Clone, Default)]
pub struct CannedResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
    /// Fail with an execution error after this many rows.
    pub fail_after: Option<usize>,
    /// Pause before every row.
    pub row_delay: Option<Duration>,
}

impl CannedResult {
    /// Column types are taken from the first row.
    pub fn new(columns: &[&str], rows: Vec<Row>) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnMeta {
                name: name.to_string(),
                type_name: rows
                    .first()
                    .and_then(|row| row.get(i))
                    .map(|value| value.type_name())
                    .unwrap_or("NULL")
                    .to_string(),
            })
            .collect();
        Self { columns, rows, fail_after: None, row_delay: None }
    }

    pub fn failing_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
pub struct MemorySource {
    results: DashMap<String, CannedResult>,
    executions: AtomicUsize,
    open_cursors: Arc<AtomicUsize>,
    execute_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `execute` call, e.g. to let concurrent callers pile up.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    pub fn with_result(self, sql: &str, result: CannedResult) -> Self {
        self.insert(sql, result);
        self
    }

    pub fn insert(&self, sql: &str, result: CannedResult) {
        self.results.insert(sql.to_string(), result);
    }

    /// Number of `execute` calls so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Cursors handed out and not closed yet.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuerySource for MemorySource {
    async fn execute(&self, sql: &str) -> Result<Box<dyn RowCursor>, Error> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .results
            .get(sql)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Execution(format!("no such table for query: {sql}")))?;

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            columns: result.columns,
            rows: result.rows.into_iter(),
            emitted: 0,
            fail_after: result.fail_after,
            row_delay: result.row_delay,
            open_cursors: Some(self.open_cursors.clone()),
        }))
    }
}

struct MemoryCursor {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Row>,
    emitted: usize,
    fail_after: Option<usize>,
    row_delay: Option<Duration>,
    open_cursors: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        if let Some(delay) = self.row_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after.is_some_and(|limit| self.emitted >= limit) {
            return Err(Error::Execution(format!("source failed after {} rows", self.emitted)));
        }
        let row = self.rows.next();
        if row.is_some() {
            self.emitted += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) {
        if let Some(counter) = self.open_cursors.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Hands out the same [`MemorySource`] for every descriptor.
pub struct MemoryConnector {
    source: Arc<MemorySource>,
}

impl MemoryConnector {
    pub fn new(source: Arc<MemorySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    async fn connect(&self, _descriptor: &SourceDescriptor) -> Result<Arc<dyn QuerySource>, Error> {
        Ok(self.source.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gencache_core::Value;

    fn rows(n: i64) -> Vec<Row> {
        (0..n).map(|i| vec![Value::Int(i)]).collect()
    }

    #[tokio::test]
    async fn test_cursor_streams_rows() {
        let source = MemorySource::new().with_result("SELECT n", CannedResult::new(&["n"], rows(3)));
        let mut cursor = source.execute("SELECT n").await.unwrap();
        assert_eq!(cursor.columns()[0].type_name, "INTEGER");

        let mut seen = 0;
        while let Some(_row) = cursor.next_row().await.unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert_eq!(source.open_cursors(), 1);
        cursor.close().await;
        cursor.close().await;
        assert_eq!(source.open_cursors(), 0);
        assert_eq!(source.executions(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sql_fails() {
        let source = MemorySource::new();
        assert!(matches!(source.execute("SELECT 1").await, Err(Error::Execution(_))));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let result = CannedResult::new(&["n"], rows(10)).failing_after(2);
        let source = MemorySource::new().with_result("q", result);
        let mut cursor = source.execute("q").await.unwrap();
        assert!(cursor.next_row().await.unwrap().is_some());
        assert!(cursor.next_row().await.unwrap().is_some());
        assert!(cursor.next_row().await.is_err());
    }
}
