//! Error types for the thumbnail cache

use std::fmt;

#[derive(Debug)]
pub enum ImageCacheError {
    /// Transport-level failure talking to the image host
    Http(Box<reqwest::Error>),
    /// The image host answered with a non-success status
    Status(u16),
    /// The response body exceeded the configured limit
    TooLarge(usize),
    Network(String),
    Decode(String),
    Io(Box<std::io::Error>),
}

impl ImageCacheError {
    /// Whether this error came from the disk tier
    pub fn is_storage(&self) -> bool {
        matches!(self, ImageCacheError::Io(_))
    }
}

impl fmt::Display for ImageCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCacheError::Http(err) => write!(f, "HTTP error: {}", err),
            ImageCacheError::Status(status) => write!(f, "Image host returned status {}", status),
            ImageCacheError::TooLarge(size) => {
                write!(f, "Image body too large: {} bytes", size)
            }
            ImageCacheError::Network(msg) => write!(f, "Network error: {}", msg),
            ImageCacheError::Decode(msg) => write!(f, "Decode error: {}", msg),
            ImageCacheError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ImageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageCacheError::Http(err) => Some(err.as_ref()),
            ImageCacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ImageCacheError {
    fn from(err: reqwest::Error) -> Self {
        ImageCacheError::Http(Box::new(err))
    }
}

impl From<std::io::Error> for ImageCacheError {
    fn from(err: std::io::Error) -> Self {
        ImageCacheError::Io(Box::new(err))
    }
}

impl From<image::ImageError> for ImageCacheError {
    fn from(err: image::ImageError) -> Self {
        ImageCacheError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImageCacheError>;
