//! Stable cache keys derived from image locators

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Identifier shared by the memory and disk tiers.
///
/// Hex-encoded SHA-256 of the canonical locator, so it is stable across
/// processes and platforms and safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a locator
    pub fn from_locator(locator: &str) -> Self {
        let canonical = canonicalize(locator);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }

    /// Rebuild a key from a file name found in the disk tier
    pub(crate) fn from_file_name(name: &str) -> Option<Self> {
        if name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Some(CacheKey(name.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parseable URLs use their serialized form (lower-cased scheme and host,
/// default port dropped); anything else is only trimmed.
fn canonicalize(locator: &str) -> String {
    let trimmed = locator.trim();
    match Url::parse(trimmed) {
        Ok(url) => url.to_string(),
        Err(_) => trimmed.to_string(),
    }
}
