//! Image payload handling before inference.
//!
//! - `decode_image_data`: accept raw base64 or a `data:image/...;base64,` URL
//! - `normalize`: downscale oversized images and re-encode them as JPEG
//! - `encode_base64`: wire form for the remote `/detect` call

use crate::error::{OfflineError, OfflineResult};
use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

/// Decode base64 image data, stripping a data-URL prefix if present.
pub fn decode_image_data(data: &str) -> OfflineResult<Vec<u8>> {
    let payload = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| OfflineError::MalformedPayload(format!("invalid base64 image data: {e}")))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Pixel dimensions of an encoded image.
pub fn dimensions(bytes: &[u8]) -> OfflineResult<(u32, u32)> {
    Ok(load(bytes)?.dimensions())
}

/// Shrink the image so its longest side is at most `max_side`, preserving
/// aspect ratio, and re-encode it as JPEG. Images already within bounds are
/// returned unchanged.
pub fn normalize(bytes: &[u8], max_side: u32) -> OfflineResult<Vec<u8>> {
    let img = load(bytes)?;
    let (w, h) = img.dimensions();
    if max_side == 0 || w.max(h) <= max_side {
        return Ok(bytes.to_vec());
    }

    let resized = img.resize(max_side, max_side, FilterType::Triangle);
    tracing::debug!(
        from = %format!("{w}x{h}"),
        to = %format!("{}x{}", resized.width(), resized.height()),
        "Downscaled image for upload"
    );

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| OfflineError::MalformedPayload(format!("failed to re-encode image: {e}")))?;
    Ok(out.into_inner())
}

fn load(bytes: &[u8]) -> OfflineResult<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| OfflineError::MalformedPayload(format!("undecodable image: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 200, 30])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn strips_data_url_prefix() {
        let raw = b"hello";
        let b64 = encode_base64(raw);
        assert_eq!(decode_image_data(&b64).unwrap(), raw);
        assert_eq!(
            decode_image_data(&format!("data:image/jpeg;base64,{b64}")).unwrap(),
            raw
        );
    }

    #[test]
    fn rejects_bad_base64() {
        let err = decode_image_data("data:image/png;base64,@@@").unwrap_err();
        assert!(matches!(err, OfflineError::MalformedPayload(_)));
    }

    #[test]
    fn downscales_large_images_preserving_aspect() {
        let out = normalize(&png(1280, 640), 640).unwrap();
        assert_eq!(dimensions(&out).unwrap(), (640, 320));
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn small_images_pass_through() {
        let original = png(32, 16);
        assert_eq!(normalize(&original, 640).unwrap(), original);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = normalize(b"not an image", 640).unwrap_err();
        assert!(matches!(err, OfflineError::MalformedPayload(_)));
    }
}
