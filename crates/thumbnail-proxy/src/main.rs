//! Thumbnail proxy
//!
//! Serves list thumbnails through a two-tier image cache so that many
//! concurrently rendered rows share memory, disk and network work.

mod error;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use std::sync::Arc;
use thumbnail_cache::ImageCacheService;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("thumbnail_proxy=info".parse()?)
        .add_directive("thumbnail_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting thumbnail proxy...");

    let config = ProxyConfig::from_env();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!(
        "Memory cache: {} entries, {} MB",
        config.cache.memory_max_entries,
        config.cache.memory_max_bytes / (1024 * 1024)
    );
    match config.cache.disk_max_bytes {
        Some(max) => info!("Disk cache budget: {} MB", max / (1024 * 1024)),
        None => info!("Disk cache budget: unbounded"),
    }

    let cache = ImageCacheService::with_http(&config.cache)?;
    cache.init().await?;

    let state: SharedState = Arc::new(ServerState::new(cache));

    start_server(state.clone(), config.port, shutdown_signal())
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    // Let background disk writes land before exiting
    state.cache.flush().await;
    info!("Thumbnail proxy stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
