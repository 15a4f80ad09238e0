//! Persistent tier of raw image bytes, one file per key

use crate::error::Result;
use crate::key::CacheKey;
use crate::types::{DiskEntry, DiskStats};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const TMP_PREFIX: &str = ".tmp-";

/// A key -> bytes store rooted in a durable directory.
///
/// Records are written once and never mutated. An in-memory index tracks
/// sizes so that an optional byte budget can be enforced.
pub struct DiskTier {
    /// In-memory index of records on disk
    entries: RwLock<HashMap<CacheKey, DiskEntry>>,
    /// Directory where records are stored
    cache_dir: PathBuf,
    /// Maximum total size in bytes, unbounded when `None`
    max_size: Option<u64>,
    /// Current total size of indexed records
    current_size: AtomicU64,
    /// Suffix for temporary files so concurrent writers never collide
    tmp_counter: AtomicU64,
}

impl DiskTier {
    pub fn new(cache_dir: PathBuf, max_size: Option<u64>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_dir,
            max_size,
            current_size: AtomicU64::new(0),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Ensure the directory exists and rebuild the index from its contents
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).await?;

        let mut index = HashMap::new();
        let mut total = 0u64;
        let mut dir = fs::read_dir(&self.cache_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if name.starts_with(TMP_PREFIX) {
                let _ = fs::remove_file(item.path()).await;
                continue;
            }

            let Some(key) = CacheKey::from_file_name(name) else {
                continue;
            };

            let metadata = match item.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = ?item.path(), error = %e, "Failed to stat cached image");
                    continue;
                }
            };

            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            total += metadata.len();
            index.insert(
                key,
                DiskEntry {
                    path: item.path(),
                    size: metadata.len(),
                    created_at,
                },
            );
        }

        let count = index.len();
        *self.entries.write().await = index;
        self.current_size.store(total, Ordering::Relaxed);

        info!(cache_dir = ?self.cache_dir, entries = count, total_size = total, "Disk tier initialized");

        if let Some(max) = self.max_size {
            self.evict_to(max).await;
        }

        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.as_str())
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Read a record. Missing records and I/O failures both yield `None`.
    pub async fn read(&self, key: &CacheKey) -> Option<Bytes> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => {
                debug!(key = %key, size = data.len(), "Disk hit");
                Some(Bytes::from(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached image");
                None
            }
        }
    }

    /// Persist a record.
    ///
    /// Data goes to a temporary file that is renamed into place, so a
    /// concurrent writer of the same key leaves one complete record behind.
    pub async fn write(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;

        if self.max_size.is_some_and(|max| size > max) {
            debug!(key = %key, size, "Image exceeds disk budget, not persisted");
            return Ok(());
        }

        let path = self.path_for(key);
        let tmp_path = self.cache_dir.join(format!(
            "{}{}-{}",
            TMP_PREFIX,
            key,
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = fs::write(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        // Rename and index update happen under the index lock, so eviction
        // never unlinks a file whose index entry is about to be replaced
        {
            let mut entries = self.entries.write().await;

            if let Err(e) = fs::rename(&tmp_path, &path).await {
                drop(entries);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }

            let entry = DiskEntry {
                path,
                size,
                created_at: Utc::now(),
            };
            if let Some(previous) = entries.insert(key.clone(), entry) {
                self.current_size.fetch_sub(previous.size, Ordering::Relaxed);
            }
            self.current_size.fetch_add(size, Ordering::Relaxed);
        }

        debug!(key = %key, size, "Persisted image");

        if let Some(max) = self.max_size {
            self.evict_to(max).await;
        }

        Ok(())
    }

    /// Remove oldest records until the total size is within `target_size`
    async fn evict_to(&self, target_size: u64) {
        loop {
            if self.current_size.load(Ordering::Relaxed) <= target_size {
                break;
            }

            let oldest_key = {
                let entries = self.entries.read().await;
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone())
            };

            match oldest_key {
                Some(key) => {
                    self.remove(&key).await;
                    debug!(key = %key, "Evicted oldest disk record");
                }
                None => break,
            }
        }
    }

    /// Remove a record from the index and from disk
    pub async fn remove(&self, key: &CacheKey) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.remove(key) else {
            return;
        };
        self.current_size.fetch_sub(entry.size, Ordering::Relaxed);

        // Unlink before releasing the lock; a concurrent write of the same
        // key renames its file in only after this
        if let Err(e) = fs::remove_file(&entry.path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(key = %key, error = %e, "Failed to remove cached image");
            }
        }
    }

    pub async fn stats(&self) -> DiskStats {
        let entries = self.entries.read().await;
        DiskStats {
            entries: entries.len(),
            total_size: self.current_size.load(Ordering::Relaxed),
            max_size: self.max_size,
        }
    }
}
