//! Splits an open cursor into bounded chunks.

use gencache_core::{Error, Row, row_size};
use tokio_util::sync::CancellationToken;

use crate::source::{ColumnMeta, RowCursor};

pub(crate) struct ChunkReader {
    cursor: Box<dyn RowCursor>,
    lookahead: Option<Row>,
    max_rows: usize,
    max_bytes: usize,
    limit: Option<u64>,
    emitted: u64,
    /// No further chunk will be produced.
    pub exhausted: bool,
    /// The row limit stopped reading while the source still had rows.
    pub truncated: bool,
    closed: bool,
}

impl ChunkReader {
    pub fn new(cursor: Box<dyn RowCursor>, max_rows: usize, max_bytes: usize, limit: Option<u64>) -> Self {
        Self {
            cursor,
            lookahead: None,
            max_rows: max_rows.max(1),
            max_bytes: max_bytes.max(1),
            limit,
            emitted: 0,
            exhausted: false,
            truncated: false,
            closed: false,
        }
    }

    pub fn columns(&self) -> (Vec<String>, Vec<String>) {
        self.cursor
            .columns()
            .iter()
            .map(|ColumnMeta { name, type_name }| (name.clone(), type_name.clone()))
            .unzip()
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.emitted >= limit)
    }

    /// Read the next chunk.
    ///
    /// Afterwards `exhausted` is exact: one row is read ahead, so a result
    /// that exactly fills a chunk is known to be complete.
    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::new();
        let mut bytes = 0usize;

        while !self.exhausted && !self.limit_reached() && rows.len() < self.max_rows && bytes < self.max_bytes {
            let Some(row) = self.take(cancel).await? else {
                self.exhausted = true;
                break;
            };
            bytes += row_size(&row);
            self.emitted += 1;
            rows.push(row);
        }

        if !self.exhausted {
            let more = self.peek(cancel).await?;
            if self.limit_reached() {
                self.truncated = more;
                self.exhausted = true;
            } else if !more {
                self.exhausted = true;
            }
        }

        Ok(rows)
    }

    pub fn rows_read(&self) -> u64 {
        self.emitted
    }

    async fn take(&mut self, cancel: &CancellationToken) -> Result<Option<Row>, Error> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        self.pull(cancel).await
    }

    async fn peek(&mut self, cancel: &CancellationToken) -> Result<bool, Error> {
        if self.lookahead.is_none() {
            self.lookahead = self.pull(cancel).await?;
        }
        Ok(self.lookahead.is_some())
    }

    async fn pull(&mut self, cancel: &CancellationToken) -> Result<Option<Row>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("stopped after {} rows", self.emitted))),
            row = self.cursor.next_row() => row,
        }
    }

    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cursor.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{CannedResult, MemorySource};
    use crate::source::QuerySource;
    use gencache_core::Value;

    async fn reader(total: i64, max_rows: usize, limit: Option<u64>) -> ChunkReader {
        let rows = (0..total).map(|i| vec![Value::Int(i)]).collect();
        let source = MemorySource::new().with_result("q", CannedResult::new(&["n"], rows));
        let cursor = source.execute("q").await.unwrap();
        ChunkReader::new(cursor, max_rows, usize::MAX, limit)
    }

    #[tokio::test]
    async fn test_exact_fit_is_single_chunk() {
        let mut reader = reader(4, 4, None).await;
        let chunk = reader.next_chunk(&CancellationToken::new()).await.unwrap();
        assert_eq!(chunk.len(), 4);
        assert!(reader.exhausted);
        assert!(!reader.truncated);
    }

    #[tokio::test]
    async fn test_splits_into_chunks() {
        let mut reader = reader(10, 4, None).await;
        let cancel = CancellationToken::new();
        let mut sizes = Vec::new();
        while !reader.exhausted {
            sizes.push(reader.next_chunk(&cancel).await.unwrap().len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(reader.rows_read(), 10);
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let mut reader = reader(10, 100, Some(3)).await;
        let chunk = reader.next_chunk(&CancellationToken::new()).await.unwrap();
        assert_eq!(chunk.len(), 3);
        assert!(reader.exhausted);
        assert!(reader.truncated);
    }

    #[tokio::test]
    async fn test_limit_equal_to_size_not_truncated() {
        let mut reader = reader(3, 100, Some(3)).await;
        reader.next_chunk(&CancellationToken::new()).await.unwrap();
        assert!(reader.exhausted);
        assert!(!reader.truncated);
    }

    #[tokio::test]
    async fn test_byte_budget_splits() {
        let rows = (0..6).map(|_| vec![Value::Text("x".repeat(92))]).collect();
        let source = MemorySource::new().with_result("q", CannedResult::new(&["s"], rows));
        let cursor = source.execute("q").await.unwrap();
        // Each row is 100 bytes; a 250 byte budget closes a chunk after its third row.
        let mut reader = ChunkReader::new(cursor, 1_000, 250, None);
        let chunk = reader.next_chunk(&CancellationToken::new()).await.unwrap();
        assert_eq!(chunk.len(), 3);
        assert!(!reader.exhausted);
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let mut reader = reader(10, 4, None).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(reader.next_chunk(&cancel).await, Err(Error::Cancelled(_))));
    }
}
