//! Cache types

use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default number of decoded images kept in memory
pub const DEFAULT_MEMORY_ENTRIES: usize = 200;
/// Default decoded-pixel budget for the memory tier (64 MiB)
pub const DEFAULT_MEMORY_BYTES: u64 = 64 * 1024 * 1024;
/// Default limit on a single downloaded image (10 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Which tier satisfied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Memory,
    Disk,
    Network,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Memory => "MEMORY",
            ImageSource::Disk => "DISK",
            ImageSource::Network => "NETWORK",
        }
    }
}

/// A decoded image returned by the cache service
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub key: CacheKey,
    pub image: Arc<DynamicImage>,
    pub source: ImageSource,
}

/// Metadata for a record in the disk tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Statistics about the disk tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: Option<u64>,
}

/// Request counters for the cache service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub network_hits: u64,
    pub failures: u64,
    /// Network fetches actually started (after coalescing)
    pub fetches: u64,
    pub memory_entries: usize,
    pub memory_size: u64,
    pub in_flight: usize,
}

/// Configuration for an [`ImageCacheService`](crate::ImageCacheService)
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub cache_dir: PathBuf,
    pub memory_max_entries: usize,
    pub memory_max_bytes: u64,
    /// `None` keeps every record on disk for the life of the installation
    pub disk_max_bytes: Option<u64>,
    pub fetch_timeout: Duration,
    pub max_image_bytes: usize,
}

impl ImageCacheConfig {
    /// Durable, app-private directory for disk records.
    ///
    /// Uses the platform's local data directory rather than its cache
    /// directory, which the OS may purge under storage pressure.
    pub fn default_cache_dir(app_name: &str) -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join(app_name).join("images"))
            .unwrap_or_else(|| PathBuf::from("./data/images"))
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir("thumbnail-cache"),
            memory_max_entries: DEFAULT_MEMORY_ENTRIES,
            memory_max_bytes: DEFAULT_MEMORY_BYTES,
            disk_max_bytes: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}
