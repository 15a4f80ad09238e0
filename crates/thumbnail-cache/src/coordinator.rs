//! Single-flight coordination of network fetches
//!
//! Concurrent requests for the same key share one underlying fetch, decode
//! included. Each caller holds a subscription on the in-flight record; when
//! the last subscriber goes away before the fetch resolves, the record is
//! dropped and with it the network future, so nobody keeps downloading an
//! image that no one is waiting for. A single caller giving up leaves the
//! fetch running for the others.
//!
//! On success the resolve hook runs before the record is retired, so a
//! caller that no longer finds the record finds whatever the hook stored.

use crate::decode::decode_blocking;
use crate::error::{ImageCacheError, Result};
use crate::fetcher::ImageFetcher;
use crate::key::CacheKey;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// A fetched image, as raw bytes and decoded
#[derive(Clone, Debug)]
pub struct FetchedImage {
    pub data: Bytes,
    pub image: Arc<DynamicImage>,
}

/// Outcome delivered to every subscriber of a fetch
pub type FetchResult = std::result::Result<FetchedImage, Arc<ImageCacheError>>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type ResolveHook = Arc<dyn Fn(&CacheKey, &FetchedImage) + Send + Sync>;
type Registry = Mutex<HashMap<CacheKey, InFlightFetch>>;

struct InFlightFetch {
    /// Distinguishes this record from a later fetch for the same key
    generation: u64,
    future: SharedFetch,
    subscribers: usize,
}

/// Collapses concurrent fetches for a key into one network request
pub struct FetchCoordinator {
    fetcher: Arc<dyn ImageFetcher>,
    on_resolved: Option<ResolveHook>,
    in_flight: Arc<Registry>,
    next_generation: AtomicU64,
    started: AtomicU64,
}

impl FetchCoordinator {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            fetcher,
            on_resolved: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            started: AtomicU64::new(0),
        }
    }

    /// Run `hook` once per successful fetch, before its record is retired
    pub fn on_resolved(
        mut self,
        hook: impl Fn(&CacheKey, &FetchedImage) + Send + Sync + 'static,
    ) -> Self {
        self.on_resolved = Some(Arc::new(hook));
        self
    }

    /// Fetch and decode the image for `key`, joining an in-flight fetch if
    /// there is one.
    ///
    /// Failures are delivered to every subscriber and are not remembered: the
    /// next call after a failure starts a new fetch.
    pub async fn fetch(&self, key: &CacheKey, locator: &str) -> FetchResult {
        let (future, _subscription) = self.subscribe(key, locator);
        future.await
    }

    fn subscribe(&self, key: &CacheKey, locator: &str) -> (SharedFetch, Subscription) {
        let mut in_flight = self.in_flight.lock();

        let (generation, future) = match in_flight.get_mut(key) {
            Some(entry) => {
                entry.subscribers += 1;
                debug!(key = %key, subscribers = entry.subscribers, "Joining in-flight fetch");
                (entry.generation, entry.future.clone())
            }
            None => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                self.started.fetch_add(1, Ordering::Relaxed);

                let future = self.start(key, locator, generation);
                in_flight.insert(
                    key.clone(),
                    InFlightFetch {
                        generation,
                        future: future.clone(),
                        subscribers: 1,
                    },
                );
                debug!(key = %key, "Started fetch");
                (generation, future)
            }
        };

        let subscription = Subscription {
            registry: Arc::clone(&self.in_flight),
            key: key.clone(),
            generation,
        };
        (future, subscription)
    }

    fn start(&self, key: &CacheKey, locator: &str, generation: u64) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let hook = self.on_resolved.clone();
        // Weak so the record does not keep its own registry alive
        let registry = Arc::downgrade(&self.in_flight);
        let key = key.clone();
        let locator = locator.to_string();

        async move {
            let result = resolve(fetcher.as_ref(), &locator).await.map_err(Arc::new);
            if let (Ok(fetched), Some(hook)) = (&result, &hook) {
                hook(&key, fetched);
            }
            retire(&registry, &key, generation);
            result
        }
        .boxed()
        .shared()
    }

    /// Number of fetches currently outstanding
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of callers waiting on the fetch for `key`
    pub fn subscribers(&self, key: &CacheKey) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }

    /// Total network fetches started since construction
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

async fn resolve(fetcher: &dyn ImageFetcher, locator: &str) -> Result<FetchedImage> {
    let data = fetcher.fetch(locator).await?;
    let image = decode_blocking(data.clone()).await?;
    Ok(FetchedImage {
        data,
        image: Arc::new(image),
    })
}

/// Remove a resolved record so later callers start from scratch
fn retire(registry: &Weak<Registry>, key: &CacheKey, generation: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };

    let removed = {
        let mut in_flight = registry.lock();
        match in_flight.get(key) {
            Some(entry) if entry.generation == generation => in_flight.remove(key),
            _ => None,
        }
    };
    drop(removed);
}

/// A caller's interest in an in-flight fetch, released on drop
struct Subscription {
    registry: Arc<Registry>,
    key: CacheKey,
    generation: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let removed = {
            let mut in_flight = self.registry.lock();
            let Some(entry) = in_flight.get_mut(&self.key) else {
                return;
            };
            // Already retired and replaced by a newer fetch
            if entry.generation != self.generation {
                return;
            }

            entry.subscribers -= 1;
            if entry.subscribers == 0 {
                debug!(key = %self.key, "Last subscriber left, cancelling fetch");
                in_flight.remove(&self.key)
            } else {
                None
            }
        };

        // Dropping the last handle to the shared future cancels the request;
        // do it outside the registry lock.
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{color_for, CountingFetcher, GatedFetcher};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ROW: &str = "https://cdn.example.com/row.png";

    fn key(locator: &str) -> CacheKey {
        CacheKey::from_locator(locator)
    }

    fn pixel(fetched: &FetchedImage) -> [u8; 4] {
        fetched.image.to_rgba8().get_pixel(0, 0).0
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let fetcher = Arc::new(CountingFetcher::images(Duration::from_millis(50)));
        let coordinator = FetchCoordinator::new(fetcher.clone());
        let k = key("https://cdn.example.com/l1.png");

        let results = futures::future::join_all(
            (0..8).map(|_| coordinator.fetch(&k, "https://cdn.example.com/l1.png")),
        )
        .await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.started(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            let fetched = result.as_ref().unwrap();
            // Decoded once, shared by everyone
            assert!(Arc::ptr_eq(&fetched.image, &first.image));
            assert_eq!(fetched.data, first.data);
        }
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let fetcher = Arc::new(CountingFetcher::images(Duration::from_millis(10)));
        let coordinator = FetchCoordinator::new(fetcher.clone());
        let a = key("https://cdn.example.com/a.png");
        let b = key("https://cdn.example.com/b.png");

        let (ra, rb) = tokio::join!(
            coordinator.fetch(&a, "https://cdn.example.com/a.png"),
            coordinator.fetch(&b, "https://cdn.example.com/b.png"),
        );

        assert_eq!(pixel(&ra.unwrap()), color_for("https://cdn.example.com/a.png"));
        assert_eq!(pixel(&rb.unwrap()), color_for("https://cdn.example.com/b.png"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let fetcher = Arc::new(CountingFetcher::failing(Duration::from_millis(20)));
        let coordinator = FetchCoordinator::new(fetcher.clone());
        let k = key("https://cdn.example.com/l2.png");

        let (r1, r2) = tokio::join!(
            coordinator.fetch(&k, "https://cdn.example.com/l2.png"),
            coordinator.fetch(&k, "https://cdn.example.com/l2.png"),
        );

        let (e1, e2) = (r1.unwrap_err(), r2.unwrap_err());
        assert!(Arc::ptr_eq(&e1, &e2));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.in_flight(), 0);

        // Next request retries the network
        assert!(coordinator
            .fetch(&k, "https://cdn.example.com/l2.png")
            .await
            .is_err());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_is_shared() {
        // Echo mode answers with the locator text, which is not an image
        let fetcher = Arc::new(CountingFetcher::new(Duration::from_millis(20)));
        let resolved = Arc::new(AtomicUsize::new(0));
        let coordinator = FetchCoordinator::new(fetcher.clone()).on_resolved({
            let resolved = resolved.clone();
            move |_, _| {
                resolved.fetch_add(1, Ordering::SeqCst);
            }
        });
        let k = key("https://cdn.example.com/broken.png");

        let (r1, r2) = tokio::join!(
            coordinator.fetch(&k, "https://cdn.example.com/broken.png"),
            coordinator.fetch(&k, "https://cdn.example.com/broken.png"),
        );

        let (e1, e2) = (r1.unwrap_err(), r2.unwrap_err());
        assert!(Arc::ptr_eq(&e1, &e2));
        assert!(matches!(*e1, ImageCacheError::Decode(_)));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resolve_hook_runs_once_per_fetch() {
        let fetcher = Arc::new(CountingFetcher::images(Duration::from_millis(20)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let coordinator = FetchCoordinator::new(fetcher.clone()).on_resolved({
            let seen = seen.clone();
            move |key, fetched| seen.lock().push((key.clone(), Arc::clone(&fetched.image)))
        });
        let k = key(ROW);

        let results = futures::future::join_all((0..4).map(|_| coordinator.fetch(&k, ROW))).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, k);
        assert!(Arc::ptr_eq(&seen[0].1, &results[0].as_ref().unwrap().image));
    }

    #[tokio::test]
    async fn test_dropping_one_subscriber_keeps_fetch_alive() {
        let fetcher = Arc::new(GatedFetcher::new());
        let coordinator = Arc::new(FetchCoordinator::new(fetcher.clone()));
        let k = key(ROW);

        let spawn = |coordinator: Arc<FetchCoordinator>, k: CacheKey| {
            tokio::spawn(async move { coordinator.fetch(&k, ROW).await })
        };
        let first = spawn(coordinator.clone(), k.clone());
        let second = spawn(coordinator.clone(), k.clone());

        while coordinator.subscribers(&k) < 2 {
            tokio::task::yield_now().await;
        }

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.subscribers(&k), 1);
        assert!(!fetcher.was_cancelled());

        fetcher.open();
        let fetched = second.await.unwrap().unwrap();
        assert_eq!(pixel(&fetched), color_for(ROW));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropping_all_subscribers_cancels_fetch() {
        let fetcher = Arc::new(GatedFetcher::new());
        let coordinator = Arc::new(FetchCoordinator::new(fetcher.clone()));
        let locator = "https://cdn.example.com/offscreen.png";
        let k = key(locator);

        let task = {
            let coordinator = coordinator.clone();
            let k = k.clone();
            tokio::spawn(async move { coordinator.fetch(&k, locator).await })
        };

        while fetcher.calls() < 1 {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;

        assert_eq!(coordinator.in_flight(), 0);
        assert!(fetcher.was_cancelled());

        // A new caller starts a fresh fetch
        fetcher.open();
        let fetched = coordinator.fetch(&k, locator).await.unwrap();
        assert_eq!(pixel(&fetched), color_for(locator));
        assert_eq!(fetcher.calls(), 2);
    }
}
