//! JPEG encoding for preview images
//!
//! JPEG has no alpha channel, so images are flattened to RGB before
//! encoding. Every encoder error maps to
//! [`CaptureError::PreviewEncodeFailed`], which is non-fatal to capture.

use std::io::Cursor;

use image::{ImageEncoder, codecs::jpeg::JpegEncoder};

use super::image_buffer::FrameImage;
use crate::error::{CaptureError, CaptureResult};

/// Encodes an image as JPEG
///
/// `quality` is clamped to `1..=100`.
///
/// # Examples
///
/// ```
/// use hdr_capture_bridge::preview::{encode::encode_jpeg, image_buffer::FrameImage};
///
/// let img = FrameImage::from_test_pattern(160, 90);
///
/// let low = encode_jpeg(&img, 40).unwrap();
/// let high = encode_jpeg(&img, 95).unwrap();
///
/// assert_eq!(&low[..2], &[0xFF, 0xD8]);
/// assert!(high.len() > low.len());
/// ```
pub fn encode_jpeg(image: &FrameImage, quality: u8) -> CaptureResult<Vec<u8>> {
    let quality = quality.clamp(1, 100);

    let rgb = image.inner().to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptureError::PreviewEncodeFailed {
            reason: "image dimensions must be > 0".to_string(),
        });
    }

    let mut output = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut output), quality)
        .write_image(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| CaptureError::PreviewEncodeFailed {
            reason: e.to_string(),
        })?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;

    #[test]
    fn test_encode_jpeg_magic_bytes() {
        let img = FrameImage::from_test_pattern(64, 64);
        let bytes = encode_jpeg(&img, 80).unwrap();

        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_quality_zero_is_clamped() {
        let img = FrameImage::from_test_pattern(32, 32);
        assert!(encode_jpeg(&img, 0).is_ok());
    }

    #[test]
    fn test_empty_image_is_preview_error() {
        let img = FrameImage::new(DynamicImage::new_rgba8(0, 0));
        let error = encode_jpeg(&img, 80).unwrap_err();

        assert_eq!(error.reason(), crate::error::FailureReason::PreviewEncodeFailed);
    }
}
