//! Generation-key tools: deps_refresh, key_get and key_valid.

use std::sync::Arc;

use gencache_client::CacheEngine;
use gencache_core::{Error, GenKey};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the deps_refresh tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DepsRefreshParams {
    /// Names to bump, e.g. ["domain:sales"]. Unknown names are created.
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepsRefreshOutput {
    pub keys: Vec<GenKey>,
}

pub async fn refresh_impl(engine: &Arc<CacheEngine>, params: DepsRefreshParams) -> Result<CallToolResult, McpError> {
    if params.names.is_empty() {
        return Err(Error::InvalidInput("names must not be empty".to_string()).into());
    }
    let keys = engine.refresh(&params.names).await?;
    json_result(&DepsRefreshOutput { keys })
}

/// Parameters for the key_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyGetParams {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

pub async fn get_key_impl(engine: &Arc<CacheEngine>, params: KeyGetParams) -> Result<CallToolResult, McpError> {
    let key = engine.get_key(&params.name, &params.dependencies).await?;
    json_result(&key)
}

/// Parameters for the key_valid tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyValidParams {
    /// A key previously returned by key_get or query_fetch.
    pub key: GenKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValidOutput {
    pub valid: bool,
}

pub async fn valid_impl(engine: &Arc<CacheEngine>, params: KeyValidParams) -> Result<CallToolResult, McpError> {
    let valid = engine.is_valid(&params.key).await?;
    json_result(&KeyValidOutput { valid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{engine, output};

    #[tokio::test]
    async fn test_refresh_invalidates_key() {
        let (engine, _) = engine();
        let params = KeyGetParams { name: "report1".to_string(), dependencies: vec!["domain:sales".to_string()] };
        let key: GenKey = serde_json::from_value(output(&get_key_impl(&engine, params).await.unwrap())).unwrap();
        assert_eq!(key.version, 0);

        let valid = output(&valid_impl(&engine, KeyValidParams { key: key.clone() }).await.unwrap());
        assert_eq!(valid["valid"], true);

        let refreshed =
            output(&refresh_impl(&engine, DepsRefreshParams { names: vec!["domain:sales".to_string()] }).await.unwrap());
        assert_eq!(refreshed["keys"][0]["name"], "domain:sales");
        assert_eq!(refreshed["keys"][0]["version"], 1);

        let valid = output(&valid_impl(&engine, KeyValidParams { key }).await.unwrap());
        assert_eq!(valid["valid"], false);
    }

    #[tokio::test]
    async fn test_refresh_requires_names() {
        let (engine, _) = engine();
        let err = refresh_impl(&engine, DepsRefreshParams { names: Vec::new() }).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }
}
