//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use std::sync::Arc;

use gencache_client::CacheEngine;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

use crate::tools::{
    CacheGetParams, DepsRefreshParams, JobCancelParams, KeyGetParams, KeyValidParams, QueryFetchParams, cache, jobs,
    keys, query,
};

/// The main MCP server handler for gencache.
#[derive(Clone)]
pub struct GenCacheServer {
    engine: Arc<CacheEngine>,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl GenCacheServer {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine, tool_router: Self::tool_router() }
    }

    #[tool(
        description = "Fetch the current result of a named SQL query. Results are versioned by generation keys and recomputed after any dependency is refreshed."
    )]
    async fn query_fetch(&self, params: Parameters<QueryFetchParams>) -> Result<CallToolResult, McpError> {
        query::fetch_impl(&self.engine, params.0).await
    }

    #[tool(description = "Read a stored result by cache key, following references and reassembling chunks.")]
    async fn cache_get(&self, params: Parameters<CacheGetParams>) -> Result<CallToolResult, McpError> {
        cache::get_impl(&self.engine, params.0).await
    }

    #[tool(description = "Remove every stored result and generation key.")]
    async fn cache_clear(&self) -> Result<CallToolResult, McpError> {
        cache::clear_impl(&self.engine).await
    }

    #[tool(description = "Bump the version of the named generation keys, invalidating every result derived from them.")]
    async fn deps_refresh(&self, params: Parameters<DepsRefreshParams>) -> Result<CallToolResult, McpError> {
        keys::refresh_impl(&self.engine, params.0).await
    }

    #[tool(description = "Resolve the current generation key for a name and its dependency names.")]
    async fn key_get(&self, params: Parameters<KeyGetParams>) -> Result<CallToolResult, McpError> {
        keys::get_key_impl(&self.engine, params.0).await
    }

    #[tool(description = "Check whether a generation key is still current, dependencies included.")]
    async fn key_valid(&self, params: Parameters<KeyValidParams>) -> Result<CallToolResult, McpError> {
        keys::valid_impl(&self.engine, params.0).await
    }

    #[tool(description = "Cancel running query executions started with the given job_id.")]
    async fn job_cancel(&self, params: Parameters<JobCancelParams>) -> Result<CallToolResult, McpError> {
        jobs::cancel_impl(&self.engine, params.0).await
    }
}

impl ServerHandler for GenCacheServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "gencache".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
