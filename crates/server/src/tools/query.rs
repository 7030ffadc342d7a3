//! query_fetch tool implementation.
//!
//! Resolves the generation key of a named query and returns its current
//! result, computing it on a miss.

use std::sync::Arc;

use gencache_client::{CacheEngine, CachedQuery, SourceDescriptor};
use gencache_core::GenKey;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::{MatrixOutput, json_result};

/// Parameters for the query_fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryFetchParams {
    /// Generation-key name the result is versioned under (e.g. "report1").
    pub name: String,

    /// SQL to run against the source on a miss.
    pub sql: String,

    /// Names whose refresh invalidates this result (e.g. "domain:sales").
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Source URL, e.g. "sqlite:///data/warehouse.db".
    pub source_url: String,

    #[serde(default)]
    pub source_user: String,

    #[serde(default)]
    pub source_password: String,

    /// Result expiry in seconds; 0 disables expiry. Defaults to the server setting.
    pub ttl_secs: Option<u64>,

    /// Stop reading the source after this many rows.
    pub limit: Option<u64>,

    /// Correlation id, usable with job_cancel.
    pub job_id: Option<String>,

    /// Return NOT_READY instead of waiting when the result must be computed.
    #[serde(default)]
    pub lazy: bool,
}

/// Output from the query_fetch tool.
#[derive(Debug, Clone, Serialize)]
pub struct QueryFetchOutput {
    pub cache_key: String,
    pub gen_key: GenKey,
    pub result: MatrixOutput,
}

/// Implementation of the query_fetch tool.
pub async fn fetch_impl(engine: &Arc<CacheEngine>, params: QueryFetchParams) -> Result<CallToolResult, McpError> {
    let query = CachedQuery {
        name: params.name,
        sql: params.sql,
        dependencies: params.dependencies,
        source: SourceDescriptor::new(params.source_url, params.source_user, params.source_password),
        ttl_secs: params.ttl_secs,
        limit: params.limit,
        job_id: params.job_id.unwrap_or_default(),
    };

    let fetched = if params.lazy { engine.fetch_lazy(&query).await? } else { engine.fetch(&query).await? };

    json_result(&QueryFetchOutput {
        cache_key: fetched.cache_key,
        gen_key: fetched.gen_key,
        result: fetched.result.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{SALES_SQL, engine, output};

    fn params(lazy: bool) -> QueryFetchParams {
        QueryFetchParams {
            name: "report1".to_string(),
            sql: SALES_SQL.to_string(),
            dependencies: vec!["domain:sales".to_string()],
            source_url: "mem://warehouse".to_string(),
            source_user: "analyst".to_string(),
            source_password: "secret".to_string(),
            ttl_secs: None,
            limit: None,
            job_id: None,
            lazy,
        }
    }

    #[tokio::test]
    async fn test_fetch_then_hit() {
        let (engine, source) = engine();

        let first = output(&fetch_impl(&engine, params(false)).await.unwrap());
        assert_eq!(first["result"]["from_cache"], false);
        assert_eq!(first["result"]["row_count"], 6);
        assert_eq!(first["gen_key"]["name"], "report1");
        assert_eq!(first["gen_key"]["dep_gen"]["domain:sales"], 0);

        let second = output(&fetch_impl(&engine, params(false)).await.unwrap());
        assert_eq!(second["result"]["from_cache"], true);
        assert_eq!(second["cache_key"], first["cache_key"]);
        assert_eq!(source.executions(), 1);
    }

    #[tokio::test]
    async fn test_lazy_not_ready() {
        let (engine, _) = engine();
        let err = fetch_impl(&engine, params(true)).await.unwrap_err();
        assert_eq!(err.code.0, -32003);
    }

    #[tokio::test]
    async fn test_unknown_table_is_computation_failure() {
        let (engine, _) = engine();
        let mut bad = params(false);
        bad.sql = "SELECT * FROM nowhere".to_string();
        let err = fetch_impl(&engine, bad).await.unwrap_err();
        assert_eq!(err.code.0, -32004);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (engine, _) = engine();
        let mut bad = params(false);
        bad.name = String::new();
        let err = fetch_impl(&engine, bad).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }
}
