//! cache_get tool implementation.
//!
//! Reads a stored result by cache key, following references and
//! reassembling chunked results.

use std::sync::Arc;

use gencache_client::CacheEngine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::{MatrixOutput, json_result};

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    /// Storage key of the result, as returned by query_fetch.
    pub cache_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheGetOutput {
    pub cache_key: String,
    pub result: MatrixOutput,
}

/// Implementation of the cache_get tool.
pub async fn get_impl(engine: &Arc<CacheEngine>, params: CacheGetParams) -> Result<CallToolResult, McpError> {
    let result = engine.get_result(&params.cache_key).await?;
    json_result(&CacheGetOutput { cache_key: params.cache_key, result: result.into() })
}
