//! Fetchers used by the unit tests

use crate::error::{ImageCacheError, Result};
use crate::fetcher::ImageFetcher;
use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// PNG bytes of a solid-colour square
pub(crate) fn png_bytes(size: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(size, size, Rgba(color));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

enum Mode {
    Echo,
    Png(u32),
    Fail,
}

/// Counts calls and answers after a fixed delay
pub(crate) struct CountingFetcher {
    calls: AtomicUsize,
    delay: Duration,
    mode: Mode,
}

impl CountingFetcher {
    /// Answers with the locator's own bytes
    pub(crate) fn new(delay: Duration) -> Self {
        Self::with_mode(delay, Mode::Echo)
    }

    /// Answers with a small PNG whose colour depends on the locator
    pub(crate) fn images(delay: Duration) -> Self {
        Self::with_mode(delay, Mode::Png(8))
    }

    /// Like `images`, with `size` x `size` pixels so decoding takes a while
    pub(crate) fn large_images(delay: Duration, size: u32) -> Self {
        Self::with_mode(delay, Mode::Png(size))
    }

    /// Fails every request with a transport error
    pub(crate) fn failing(delay: Duration) -> Self {
        Self::with_mode(delay, Mode::Fail)
    }

    fn with_mode(delay: Duration, mode: Mode) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            mode,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn color_for(locator: &str) -> [u8; 4] {
    let sum = locator.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    [(sum & 0xff) as u8, ((sum >> 8) & 0xff) as u8, ((sum >> 16) & 0xff) as u8, 255]
}

#[async_trait]
impl ImageFetcher for CountingFetcher {
    async fn fetch(&self, locator: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        match self.mode {
            Mode::Echo => Ok(Bytes::from(locator.to_string())),
            Mode::Png(size) => Ok(Bytes::from(png_bytes(size, color_for(locator)))),
            Mode::Fail => Err(ImageCacheError::Network("connection reset".to_string())),
        }
    }
}

/// Blocks every request until opened, and notices when a request is dropped.
/// Answers like `CountingFetcher::images`.
pub(crate) struct GatedFetcher {
    calls: AtomicUsize,
    gate: Semaphore,
    cancelled: AtomicBool,
}

impl GatedFetcher {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn open(&self) {
        self.gate.add_permits(1024);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct CancelGuard<'a> {
    flag: &'a AtomicBool,
    done: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ImageFetcher for GatedFetcher {
    async fn fetch(&self, locator: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelGuard {
            flag: &self.cancelled,
            done: false,
        };

        let _permit = self.gate.acquire().await;
        guard.done = true;
        Ok(Bytes::from(png_bytes(8, color_for(locator))))
    }
}
