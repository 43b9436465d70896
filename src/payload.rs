//! Image payload decoding
//!
//! Requests carry images as `data:<mime>;base64,<payload>` URLs. Bare base64
//! strings are accepted as well.

use base64::{engine::general_purpose, Engine as _};
use image::DynamicImage;

use crate::error::ServerError;

/// Extract the base64 payload from a data URL or bare base64 string.
pub fn base64_payload(image_url: &str) -> Result<&str, ServerError> {
    let image_url = image_url.trim();
    let payload = match image_url.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| ServerError::ImageDecode("data URL has no payload".to_string()))?;
            if !header.ends_with(";base64") {
                return Err(ServerError::ImageDecode(
                    "data URL is not base64-encoded".to_string(),
                ));
            }
            data
        }
        None => image_url,
    };

    if payload.is_empty() {
        return Err(ServerError::ImageDecode("empty image payload".to_string()));
    }
    Ok(payload)
}

/// Decode an `image_url` request field into an image.
pub fn decode_image_url(image_url: &str) -> Result<DynamicImage, ServerError> {
    let payload = base64_payload(image_url)?;
    let bytes = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ServerError::ImageDecode(format!("invalid base64: {}", e)))?;

    image::load_from_memory(&bytes)
        .map_err(|e| ServerError::ImageDecode(format!("failed to decode image: {}", e)))
}
