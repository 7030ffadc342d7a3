//! Values stored under a cache key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RawMatrix;

/// Pointer to one stored chunk of a larger result.
///
/// Bounds are row offsets into the logical result: `row_lower_bound` is
/// inclusive and `row_upper_bound` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub key: String,
    pub row_lower_bound: u64,
    pub row_upper_bound: u64,
}

impl ChunkRef {
    /// Storage key of the chunk covering `[lower, upper)` of `key`.
    pub fn chunk_key(key: &str, lower: u64, upper: u64) -> String {
        format!("{key}_{lower}-{upper}")
    }

    pub fn new(key: &str, lower: u64, upper: u64) -> Self {
        Self { key: Self::chunk_key(key, lower, upper), row_lower_bound: lower, row_upper_bound: upper }
    }
}

/// Append-only manifest of a chunked result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuesList {
    pub chunks: Vec<ChunkRef>,
    pub done: bool,
    pub error: bool,
    /// Last time the writer stored this manifest.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ValuesList {
    /// Total rows referenced so far.
    pub fn row_count(&self) -> u64 {
        self.chunks.last().map(|c| c.row_upper_bound).unwrap_or(0)
    }

    /// Append a chunk; bounds must continue where the previous chunk ended.
    pub fn push(&mut self, chunk: ChunkRef) {
        debug_assert_eq!(chunk.row_lower_bound, self.row_count());
        self.chunks.push(chunk);
    }

    /// Stamp the manifest as written now.
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// An unfinished manifest whose writer has not stored it within `window`.
    ///
    /// A manifest without a stamp cannot prove its writer is alive and counts
    /// as abandoned.
    pub fn is_abandoned(&self, window: Duration) -> bool {
        if self.done || self.error {
            return false;
        }
        match self.updated_at {
            None => true,
            Some(at) => (Utc::now() - at).to_std().is_ok_and(|elapsed| elapsed > window),
        }
    }
}

/// Everything that can live under a cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Matrix(RawMatrix),
    Reference { reference_key: String },
    ValuesList(ValuesList),
}

impl CacheEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEntry::Matrix(_) => "matrix",
            CacheEntry::Reference { .. } => "reference",
            CacheEntry::ValuesList(_) => "values_list",
        }
    }
}
