//! Two-tier thumbnail cache
//!
//! Serves decoded images for many concurrently rendered rows. Lookups go to
//! an in-memory LRU of decoded images, then to a durable on-disk store of raw
//! bytes, and finally to the network, where concurrent requests for the same
//! image share a single fetch.

mod coordinator;
mod decode;
mod disk;
mod error;
mod fetcher;
mod key;
mod memory;
mod service;
mod types;

#[cfg(test)]
mod testing;

pub use coordinator::{FetchCoordinator, FetchResult, FetchedImage};
pub use decode::{decode_image, decoded_size};
pub use disk::DiskTier;
pub use error::{ImageCacheError, Result};
pub use fetcher::{HttpFetcher, ImageFetcher};
pub use key::CacheKey;
pub use memory::MemoryTier;
pub use service::ImageCacheService;
pub use types::{
    CacheStats, CachedImage, DiskEntry, DiskStats, ImageCacheConfig, ImageSource,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES, DEFAULT_MEMORY_BYTES, DEFAULT_MEMORY_ENTRIES,
};

pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use image::DynamicImage;
