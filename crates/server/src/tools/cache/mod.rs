//! Cache-related MCP tools.
//!
//! This module provides tools for reading and emptying the backing store.

pub mod clear;
pub mod get;

pub use clear::clear_impl;
pub use get::{CacheGetParams, get_impl};
