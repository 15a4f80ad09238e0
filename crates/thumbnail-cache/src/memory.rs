//! In-process tier of decoded images with LRU eviction

use crate::key::CacheKey;
use image::DynamicImage;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
struct MemoryEntry {
    image: Arc<DynamicImage>,
    size: u64,
}

/// Bounded key -> decoded image store.
///
/// Entries are weighed by decoded size against the byte budget. Every entry
/// is charged at least an equal share of the budget (`max_bytes / max_entries`),
/// which caps the entry count as well. Least recently accessed entries are
/// evicted first.
///
/// Cloning is cheap and shares the underlying store.
#[derive(Clone)]
pub struct MemoryTier {
    cache: Cache<CacheKey, MemoryEntry>,
    max_entries: usize,
    max_bytes: u64,
}

impl MemoryTier {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let share = (max_bytes / max_entries.max(1) as u64).max(1);

        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_key: &CacheKey, entry: &MemoryEntry| -> u32 {
                entry.size.max(share).try_into().unwrap_or(u32::MAX)
            })
            .eviction_listener(|key, _entry, cause| {
                if cause.was_evicted() {
                    debug!(key = %key, "Evicted least recently used image");
                }
            })
            .build();

        Self {
            cache,
            max_entries,
            max_bytes,
        }
    }

    /// Look up an image, marking it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.cache.get(key).map(|entry| entry.image)
    }

    /// Insert or replace an image, then evict down to budget
    pub fn put(&self, key: CacheKey, image: Arc<DynamicImage>, size: u64) {
        if size > self.max_bytes || self.max_entries == 0 {
            debug!(key = %key, size, max_bytes = self.max_bytes, "Image exceeds memory budget, not retained");
            // A replaced image must not keep being served
            self.cache.invalidate(&key);
            return;
        }

        self.cache.insert(key, MemoryEntry { image, size });
        self.cache.run_pending_tasks();
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.cache.remove(key).is_some();
        self.cache.run_pending_tasks();
        removed
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded bytes currently held
    pub fn total_size(&self) -> u64 {
        self.cache.iter().map(|(_, entry)| entry.size).sum()
    }
}
