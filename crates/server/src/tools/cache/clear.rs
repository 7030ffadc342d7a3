//! cache_clear tool implementation.

use std::sync::Arc;

use gencache_client::CacheEngine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Output from the cache_clear tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheClearOutput {
    /// Number of keys removed, generation keys included.
    pub removed: u64,
}

pub async fn clear_impl(engine: &Arc<CacheEngine>) -> Result<CallToolResult, McpError> {
    let removed = engine.clear().await?;
    json_result(&CacheClearOutput { removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{SALES_SQL, engine, output};
    use gencache_client::{CachedQuery, SourceDescriptor};

    #[tokio::test]
    async fn test_clear_removes_results_and_keys() {
        let (engine, _) = engine();
        let query = CachedQuery::new("report1", SALES_SQL, SourceDescriptor::new("mem://db", "", ""));
        let fetched = engine.fetch(&query).await.unwrap();

        let result = clear_impl(&engine).await.unwrap();
        let cleared: CacheClearOutput = serde_json::from_value(output(&result)).unwrap();
        // The result plus the generation key of report1.
        assert_eq!(cleared.removed, 2);
        assert!(!engine.in_cache(&fetched.cache_key).await.unwrap());
    }
}
