//! SQLite query source.
//!
//! Statements run on the tokio-rusqlite background thread and stream rows back
//! through a bounded channel, so a slow consumer holds the statement open
//! instead of buffering the whole result. Closing the cursor closes the
//! channel, which stops the statement at its next row.

use std::sync::Arc;

use async_trait::async_trait;
use gencache_core::{Error, Row, Value};
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite;
use tokio_rusqlite::rusqlite::types::ValueRef;

use super::{ColumnMeta, QuerySource, RowCursor, SourceConnector, SourceDescriptor};

/// Rows in flight between the statement and the cursor.
const ROW_BUFFER: usize = 256;

enum StreamEvent {
    Columns(Vec<ColumnMeta>),
    Row(Row),
    Done,
    Failed(String),
}

/// Opens one connection per descriptor; `url` is `sqlite://<path>` or
/// `sqlite::memory:`. Credentials are ignored.
#[derive(Debug, Default)]
pub struct SqliteConnector;

#[async_trait]
impl SourceConnector for SqliteConnector {
    async fn connect(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn QuerySource>, Error> {
        let conn = if descriptor.url == "sqlite::memory:" {
            Connection::open_in_memory().await
        } else if let Some(path) = descriptor.url.strip_prefix("sqlite://") {
            Connection::open(path).await
        } else {
            return Err(Error::InvalidInput(format!("not a sqlite url: {}", descriptor.url)));
        };
        let conn = conn.map_err(|e| Error::Database(e.into()))?;
        Ok(Arc::new(SqliteSource::new(conn)))
    }
}

#[derive(Clone, Debug)]
pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

fn column_meta(names: &[String], first_row: Option<&Row>) -> Vec<ColumnMeta> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| ColumnMeta {
            name: name.clone(),
            type_name: first_row
                .and_then(|row| row.get(i))
                .map(Value::type_name)
                .unwrap_or("NULL")
                .to_string(),
        })
        .collect()
}

/// Runs on the database thread. Columns are announced with the first row so
/// their types can be read off the values.
fn stream_rows(conn: &mut rusqlite::Connection, sql: &str, tx: &mpsc::Sender<StreamEvent>) -> Result<(), Error> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = names.len();
    let mut rows = stmt.query([])?;
    let mut announced = false;

    while let Some(row) = rows.next()? {
        let values = (0..width)
            .map(|i| row.get_ref(i).map(to_value))
            .collect::<Result<Row, _>>()?;

        if !announced {
            announced = true;
            if tx.blocking_send(StreamEvent::Columns(column_meta(&names, Some(&values)))).is_err() {
                return Ok(());
            }
        }
        if tx.blocking_send(StreamEvent::Row(values)).is_err() {
            tracing::debug!("sqlite cursor closed early, stopping statement");
            return Ok(());
        }
    }

    if !announced && tx.blocking_send(StreamEvent::Columns(column_meta(&names, None))).is_err() {
        return Ok(());
    }
    let _ = tx.blocking_send(StreamEvent::Done);
    Ok(())
}

#[async_trait]
impl QuerySource for SqliteSource {
    async fn execute(&self, sql: &str) -> Result<Box<dyn RowCursor>, Error> {
        let (tx, mut rx) = mpsc::channel(ROW_BUFFER);
        let sql = sql.to_string();
        let conn = self.conn.clone();

        tokio::spawn(async move {
            let result = conn
                .call(move |conn| -> Result<(), Error> {
                    if let Err(e) = stream_rows(conn, &sql, &tx) {
                        let _ = tx.blocking_send(StreamEvent::Failed(e.to_string()));
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "sqlite connection dropped statement");
            }
        });

        match rx.recv().await {
            Some(StreamEvent::Columns(columns)) => Ok(Box::new(SqliteCursor { columns, rx, finished: false })),
            Some(StreamEvent::Failed(reason)) => Err(Error::Execution(reason)),
            Some(_) => Err(Error::Execution("sqlite stream out of order".into())),
            None => Err(Error::Execution("sqlite connection closed".into())),
        }
    }
}

struct SqliteCursor {
    columns: Vec<ColumnMeta>,
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

#[async_trait]
impl RowCursor for SqliteCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Row(row)) => Ok(Some(row)),
            Some(StreamEvent::Done) => {
                self.finished = true;
                Ok(None)
            }
            Some(StreamEvent::Failed(reason)) => {
                self.finished = true;
                Err(Error::Execution(reason))
            }
            Some(StreamEvent::Columns(_)) => Err(Error::Execution("sqlite stream out of order".into())),
            None => {
                self.finished = true;
                Err(Error::Execution("sqlite stream interrupted".into()))
            }
        }
    }

    async fn close(&mut self) {
        self.finished = true;
        self.rx.close();
    }
}
