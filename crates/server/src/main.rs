//! gencache server entry point.
//!
//! Loads configuration, opens the backing store and boots the MCP server on
//! stdio transport. Logging goes to stderr to avoid interfering with the
//! JSON-RPC protocol on stdout.

use std::sync::Arc;

use anyhow::Result;
use gencache_client::{CacheEngine, SqliteConnector};
use gencache_core::{AppConfig, open_store};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(store = %config.store_url, prefix = %config.key_prefix, "Starting gencache server on stdio transport");

    let store = open_store(&config.store_url).await?;
    let engine = Arc::new(CacheEngine::new(config, store, Arc::new(SqliteConnector)));

    let handler = handler::GenCacheServer::new(engine.clone());
    let server = serve_server(handler, stdio()).await?;
    server.waiting().await?;

    let in_flight = engine.in_flight();
    if in_flight > 0 {
        tracing::warn!(in_flight, "shutting down with executions still running");
    }

    Ok(())
}
