//! Unified error types for gencache.
//!
//! Every message carries a stable code prefix so callers (and the MCP
//! surface) can tell structural corruption apart from execution failures and
//! plain "not computed yet" conditions.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

/// Unified error types for the result cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty SQL).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// No cache entry found for the given key.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    /// The entry exists but is not complete yet, or a lazy lookup found nothing.
    #[error("NOT_READY: {0}")]
    NotReady(String),

    /// A chain of cache references loops back on itself.
    #[error("CYCLIC_REFERENCE: {key} revisited while dereferencing {origin}")]
    CyclicReference { origin: String, key: String },

    /// Generation keys depend on each other in a loop.
    #[error("CYCLIC_DEPENDENCY: {0}")]
    CyclicDependency(String),

    /// Serialized entry carries a type tag this build does not know.
    #[error("UNKNOWN_TYPE_TAG: {tag} at {key}")]
    UnknownTypeTag { key: String, tag: u8 },

    /// Serialized entry could not be decoded.
    #[error("DECODE_ERROR: {0}")]
    Decode(String),

    /// The source query failed while executing or streaming.
    #[error("EXECUTION_FAILED: {0}")]
    Execution(String),

    /// A shared computation failed; every waiter observes the same failure.
    #[error("COMPUTATION_FAILED: {key}: {reason}")]
    ComputationFailed { key: String, reason: String },

    /// The execution was cancelled through its handle.
    #[error("CANCELLED: {0}")]
    Cancelled(String),

    /// Remote store operation failed.
    #[error("STORE_ERROR: {0}")]
    Store(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),
}

impl Error {
    /// Structural errors indicate corruption or a bug and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CyclicReference { .. } | Error::CyclicDependency(_) | Error::UnknownTypeTag { .. } | Error::Decode(_)
        )
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InvalidInput(_) => -32602,
            Error::CacheMiss(_) => -32001,
            Error::Database(_) | Error::MigrationFailed(_) | Error::Store(_) => -32002,
            Error::NotReady(_) => -32003,
            Error::ComputationFailed { .. } | Error::Execution(_) => -32004,
            Error::Cancelled(_) => -32005,
            Error::CyclicReference { .. }
            | Error::CyclicDependency(_)
            | Error::UnknownTypeTag { .. }
            | Error::Decode(_) => -32006,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CacheMiss("abc123".to_string());
        assert!(err.to_string().contains("CACHE_MISS"));
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_error_to_mcp_error() {
        let err = Error::NotReady("abc123".to_string());
        let mcp_err: McpError = err.into();
        assert_eq!(mcp_err.code.0, -32003);
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        let cyclic = Error::CyclicReference { origin: "a".into(), key: "a".into() };
        assert!(cyclic.is_fatal());
        assert!(Error::UnknownTypeTag { key: "k".into(), tag: 9 }.is_fatal());
        assert!(!Error::Execution("boom".into()).is_fatal());
        assert!(!Error::NotReady("k".into()).is_fatal());
    }
}
