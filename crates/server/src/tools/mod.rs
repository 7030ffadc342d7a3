//! MCP tool implementations.
//!
//! This module contains all tools exposed by the gencache server. Each tool
//! is a plain `*_impl` function over a [`CacheEngine`] so it can be tested
//! without a transport.

pub mod cache;
pub mod jobs;
pub mod keys;
pub mod query;

pub use cache::{CacheGetParams, clear_impl, get_impl};
pub use jobs::{JobCancelParams, cancel_impl};
pub use keys::{DepsRefreshParams, KeyGetParams, KeyValidParams, get_key_impl, refresh_impl, valid_impl};
pub use query::{QueryFetchParams, fetch_impl};

use gencache_core::{Error, RawMatrix, Value};
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

/// A result matrix with cells as plain JSON values.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixOutput {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub row_count: usize,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub has_more: bool,
    pub from_cache: bool,
    pub executed_at: String,
}

impl From<RawMatrix> for MatrixOutput {
    fn from(matrix: RawMatrix) -> Self {
        Self {
            row_count: matrix.len(),
            rows: matrix.rows.iter().map(|row| row.iter().map(cell_json).collect()).collect(),
            columns: matrix.columns,
            column_types: matrix.column_types,
            has_more: matrix.has_more,
            from_cache: matrix.from_cache,
            executed_at: matrix.executed_at.to_rfc3339(),
        }
    }
}

fn cell_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map_or_else(|| serde_json::Value::String(f.to_string()), serde_json::Value::Number),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => serde_json::Value::from(bytes.clone()),
    }
}

/// Serialize a tool output as pretty JSON text content.
pub(crate) fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
