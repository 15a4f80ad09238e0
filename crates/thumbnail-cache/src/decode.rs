//! Decode raw bytes into image handles

use crate::error::{ImageCacheError, Result};
use image::DynamicImage;

/// Decode bytes in any of the enabled formats (JPEG, PNG, WebP, GIF)
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    if data.is_empty() {
        return Err(ImageCacheError::Decode("empty image data".to_string()));
    }
    Ok(image::load_from_memory(data)?)
}

/// Size of the decoded pixel buffer, used for the memory budget
pub fn decoded_size(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}

/// Decode on the blocking pool so large images do not stall the runtime
pub(crate) async fn decode_blocking(data: bytes::Bytes) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || decode_image(&data))
        .await
        .map_err(|e| ImageCacheError::Decode(format!("decode task failed: {}", e)))?
}
