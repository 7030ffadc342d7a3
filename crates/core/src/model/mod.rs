//! Serialized value model.
//!
//! Results are stored as one of three entry kinds: a full `RawMatrix`, a
//! redirect to another key, or a `ValuesList` manifest naming the chunks of a
//! result too large for one entry.

pub mod codec;
pub mod entry;
pub mod matrix;

pub use entry::{CacheEntry, ChunkRef, ValuesList};
pub use matrix::{RawMatrix, Row, Value, row_size};
