//! job_cancel tool implementation.

use std::sync::Arc;

use gencache_client::CacheEngine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the job_cancel tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCancelParams {
    /// The job_id passed to query_fetch.
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelOutput {
    /// Running executions that were asked to stop.
    pub cancelled: usize,
    /// Executions and background continuations still running.
    pub in_flight: usize,
}

pub async fn cancel_impl(engine: &Arc<CacheEngine>, params: JobCancelParams) -> Result<CallToolResult, McpError> {
    let cancelled = engine.cancel_job(&params.job_id);
    json_result(&JobCancelOutput { cancelled, in_flight: engine.in_flight() })
}
