//! Tiered image lookup: memory, then disk, then a coordinated network fetch

use crate::coordinator::FetchCoordinator;
use crate::decode::{decode_blocking, decoded_size};
use crate::disk::DiskTier;
use crate::error::Result;
use crate::fetcher::{HttpFetcher, ImageFetcher};
use crate::key::CacheKey;
use crate::memory::MemoryTier;
use crate::types::{CacheStats, CachedImage, DiskStats, ImageCacheConfig, ImageSource};
use bytes::Bytes;
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    network_hits: AtomicU64,
    failures: AtomicU64,
}

/// Background disk writes, one per key at a time
#[derive(Default)]
struct PendingWrites {
    keys: Mutex<HashSet<CacheKey>>,
    done: Notify,
}

/// Serves decoded images for locators from a two-tier cache.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
/// Safe to call redundantly and concurrently for the same locator.
pub struct ImageCacheService {
    memory: MemoryTier,
    disk: Arc<DiskTier>,
    coordinator: FetchCoordinator,
    counters: Counters,
    pending_writes: Arc<PendingWrites>,
}

impl ImageCacheService {
    pub fn new(config: &ImageCacheConfig, fetcher: Arc<dyn ImageFetcher>) -> Self {
        let memory = MemoryTier::new(config.memory_max_entries, config.memory_max_bytes);
        let disk = Arc::new(DiskTier::new(
            config.cache_dir.clone(),
            config.disk_max_bytes,
        ));
        let pending_writes = Arc::new(PendingWrites::default());

        // Populate both tiers before the in-flight record is retired, so a
        // caller arriving right after resolution hits memory
        let coordinator = FetchCoordinator::new(fetcher).on_resolved({
            let memory = memory.clone();
            let disk = Arc::clone(&disk);
            let pending_writes = Arc::clone(&pending_writes);
            move |key, fetched| {
                let size = decoded_size(&fetched.image);
                memory.put(key.clone(), Arc::clone(&fetched.image), size);
                persist(&disk, &pending_writes, key.clone(), fetched.data.clone());
            }
        });

        Self {
            memory,
            disk,
            coordinator,
            counters: Counters::default(),
            pending_writes,
        }
    }

    /// Create a service that fetches over HTTP with the configured limits
    pub fn with_http(config: &ImageCacheConfig) -> Result<Self> {
        let fetcher = HttpFetcher::with_limits(config.fetch_timeout, config.max_image_bytes)?;
        Ok(Self::new(config, Arc::new(fetcher)))
    }

    /// Prepare the disk tier
    pub async fn init(&self) -> Result<()> {
        self.disk.init().await
    }

    /// Resolve an image, or `None` if it cannot be obtained right now.
    ///
    /// Failures are logged and never remembered; the next call retries.
    pub async fn get_image(&self, locator: &str) -> Option<CachedImage> {
        let key = CacheKey::from_locator(locator);

        if let Some(image) = self.memory.get(&key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Memory hit");
            return Some(CachedImage {
                key,
                image,
                source: ImageSource::Memory,
            });
        }

        if let Some(data) = self.disk.read(&key).await {
            match decode_blocking(data).await {
                Ok(image) => {
                    let image = self.remember(&key, image);
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(CachedImage {
                        key,
                        image,
                        source: ImageSource::Disk,
                    });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached image is unreadable, refetching");
                }
            }
        }

        match self.coordinator.fetch(&key, locator).await {
            Ok(fetched) => {
                self.counters.network_hits.fetch_add(1, Ordering::Relaxed);
                Some(CachedImage {
                    key,
                    image: fetched.image,
                    source: ImageSource::Network,
                })
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, locator, error = %e, "Failed to fetch image");
                None
            }
        }
    }

    fn remember(&self, key: &CacheKey, image: DynamicImage) -> Arc<DynamicImage> {
        let size = decoded_size(&image);
        let image = Arc::new(image);
        self.memory.put(key.clone(), Arc::clone(&image), size);
        image
    }

    /// Wait until all background disk writes have finished
    pub async fn flush(&self) {
        loop {
            let notified = self.pending_writes.done.notified();
            if self.pending_writes.keys.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            network_hits: self.counters.network_hits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            fetches: self.coordinator.started(),
            memory_entries: self.memory.len(),
            memory_size: self.memory.total_size(),
            in_flight: self.coordinator.in_flight(),
        }
    }

    pub async fn disk_stats(&self) -> DiskStats {
        self.disk.stats().await
    }
}

/// Write to disk in the background. Failures are logged only: the caller
/// already has its image.
fn persist(disk: &Arc<DiskTier>, pending: &Arc<PendingWrites>, key: CacheKey, data: Bytes) {
    if !pending.keys.lock().insert(key.clone()) {
        return;
    }

    let disk = Arc::clone(disk);
    let pending = Arc::clone(pending);
    tokio::spawn(async move {
        if let Err(e) = disk.write(&key, &data).await {
            warn!(key = %key, error = %e, "Failed to persist image");
        }
        pending.keys.lock().remove(&key);
        pending.done.notify_waiters();
    });
}
