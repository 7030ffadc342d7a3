//! Core types and shared functionality for gencache.
//!
//! This crate provides:
//! - Serialized value model and its versioned envelope
//! - Backing stores (memory, SQLite, Redis) behind one trait
//! - The cache-store proxy that reassembles chained and chunked results
//! - The generation-key authority
//! - Unified error types and configuration

pub mod config;
pub mod error;
pub mod genkey;
pub mod hash;
pub mod model;
pub mod proxy;
pub mod store;

pub use config::{AppConfig, ConfigError, InProgressPolicy};
pub use error::Error;
pub use genkey::{GenKey, GenKeyAuthority};
pub use hash::compute_cache_key;
pub use model::{CacheEntry, ChunkRef, RawMatrix, Row, Value, ValuesList, row_size};
pub use proxy::{CacheProxy, EntryStatus, ProxyConfig};
pub use store::{KvStore, MemoryStore, RedisStore, SqliteStore, open_store};
