//! Network collaborator: fetch raw image bytes by locator

use crate::error::{ImageCacheError, Result};
use crate::types::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("thumbnail-cache/", env!("CARGO_PKG_VERSION"));

/// Source of raw image bytes
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Bytes>;
}

/// HTTP client for fetching images from their hosts
pub struct HttpFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Create a fetcher with default timeout and size limit
    pub fn new() -> Result<Self> {
        Self::with_limits(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES)
    }

    pub fn with_limits(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<Bytes> {
        let url = reqwest::Url::parse(locator.trim())
            .map_err(|e| ImageCacheError::Network(format!("Invalid image URL {}: {}", locator, e)))?;

        debug!(url = %url, "Fetching image");

        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Failed to fetch image");
            return Err(ImageCacheError::Status(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(ImageCacheError::TooLarge(length as usize));
            }
        }

        let data = response.bytes().await?;
        if data.len() > self.max_bytes {
            return Err(ImageCacheError::TooLarge(data.len()));
        }

        debug!(url = %url, size = data.len(), "Fetched image");
        Ok(data)
    }
}
