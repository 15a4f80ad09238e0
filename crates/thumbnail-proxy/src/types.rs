//! Core types for the thumbnail proxy

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thumbnail_cache::{CacheStats, DiskStats, ImageCacheConfig};

const APP_NAME: &str = "thumbnail-proxy";

/// Configuration for the thumbnail proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache: ImageCacheConfig,
}

impl ProxyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from a variable lookup; unparseable values fall
    /// back to their defaults
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = var("PORT")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let cache_dir = var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache.cache_dir);

        let memory_max_entries = var("MEMORY_CACHE_ENTRIES")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.cache.memory_max_entries);

        let memory_max_bytes = var("MEMORY_CACHE_BYTES")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.cache.memory_max_bytes);

        // Unset means unbounded
        let disk_max_bytes = var("DISK_CACHE_MAX_BYTES").and_then(|s| s.parse::<u64>().ok());

        let fetch_timeout = var("FETCH_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache.fetch_timeout);

        let max_image_bytes = var("MAX_IMAGE_BYTES")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.cache.max_image_bytes);

        Self {
            port,
            cache: ImageCacheConfig {
                cache_dir,
                memory_max_entries,
                memory_max_bytes,
                disk_max_bytes,
                fetch_timeout,
                max_image_bytes,
            },
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            cache: ImageCacheConfig {
                cache_dir: ImageCacheConfig::default_cache_dir(APP_NAME),
                ..ImageCacheConfig::default()
            },
        }
    }
}

/// Query string for the thumbnail endpoint
#[derive(Debug, Deserialize)]
pub struct ThumbQuery {
    pub url: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub disk: DiskStats,
}
