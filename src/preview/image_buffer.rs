//! Frame-to-image conversion for the preview path
//!
//! `FrameImage` wraps an RGBA `image::DynamicImage` built from a raw captured
//! frame. Row padding is dropped and BGRA frames are swizzled to RGBA on the
//! way in, so everything downstream sees one channel order.
//!
//! # Examples
//!
//! ```
//! use hdr_capture_bridge::{model::PixelFormat, preview::image_buffer::FrameImage};
//!
//! // 2x1 BGRA frame with 4 bytes of row padding
//! let raw = [10, 20, 30, 255, 40, 50, 60, 255, 0, 0, 0, 0];
//! let image = FrameImage::from_raw(&raw, 2, 1, 12, PixelFormat::Bgra8).unwrap();
//!
//! assert_eq!(image.dimensions(), (2, 1));
//! assert_eq!(&image.to_rgba8().as_raw()[..4], &[30, 20, 10, 255]);
//! ```

use image::{DynamicImage, GenericImageView, RgbaImage, imageops::FilterType};

use crate::{
    error::{CaptureError, CaptureResult},
    model::PixelFormat,
};

/// RGBA image decoded from a captured frame
#[derive(Clone, Debug)]
pub struct FrameImage {
    inner: DynamicImage,
}

impl FrameImage {
    pub fn new(image: DynamicImage) -> Self {
        Self { inner: image }
    }

    /// Builds an RGBA image from a strided frame
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidParameter`] if the dimensions are zero,
    /// the stride is shorter than a row, or `bytes` is shorter than
    /// `stride * height`.
    pub fn from_raw(
        bytes: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        pixel_format: PixelFormat,
    ) -> CaptureResult<Self> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidParameter {
                parameter: "dimensions".to_string(),
                reason:    "Frame dimensions must be > 0".to_string(),
            });
        }

        let row_bytes = width as usize * 4;
        let stride = stride as usize;
        if stride < row_bytes {
            return Err(CaptureError::InvalidParameter {
                parameter: "stride".to_string(),
                reason:    format!("stride {stride} is shorter than a {row_bytes} byte row"),
            });
        }
        let needed = stride * height as usize;
        if bytes.len() < needed {
            return Err(CaptureError::InvalidParameter {
                parameter: "bytes".to_string(),
                reason:    format!("frame has {} bytes, layout needs {needed}", bytes.len()),
            });
        }

        let mut packed = Vec::with_capacity(row_bytes * height as usize);
        for row in bytes[..needed].chunks_exact(stride) {
            let row = &row[..row_bytes];
            match pixel_format {
                PixelFormat::Rgba8 => packed.extend_from_slice(row),
                PixelFormat::Bgra8 => {
                    for px in row.chunks_exact(4) {
                        packed.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                    }
                }
            }
        }

        let image = RgbaImage::from_raw(width, height, packed).ok_or_else(|| {
            CaptureError::InvalidParameter {
                parameter: "bytes".to_string(),
                reason:    "packed buffer does not match dimensions".to_string(),
            }
        })?;
        Ok(Self::new(DynamicImage::ImageRgba8(image)))
    }

    /// Downscales to fit within `max_width × max_height`, preserving aspect
    /// ratio. Images already inside the box are returned unchanged.
    pub fn fit_within(&self, max_width: u32, max_height: u32) -> Self {
        let (width, height) = self.dimensions();
        let (target_width, target_height) = fit_dimensions(width, height, max_width, max_height);
        if (target_width, target_height) == (width, height) {
            return self.clone();
        }
        Self::new(
            self.inner
                .resize_exact(target_width, target_height, FilterType::Triangle),
        )
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    pub fn to_rgba8(&self) -> RgbaImage {
        self.inner.to_rgba8()
    }

    pub fn inner(&self) -> &DynamicImage {
        &self.inner
    }

    /// Vertical blue-to-cyan gradient, for benches and tests
    pub fn from_test_pattern(width: u32, height: u32) -> Self {
        let image = RgbaImage::from_fn(width, height, |_x, y| {
            let ratio = y as f32 / height.max(1) as f32;
            image::Rgba([0, (255.0 * ratio) as u8, 255, 255])
        });
        Self::new(DynamicImage::ImageRgba8(image))
    }
}

/// Largest size inside `max_width × max_height` with the source aspect ratio
///
/// Never upscales and never returns a zero dimension.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (f64::from(max_width) / f64::from(width))
        .min(f64::from(max_height) / f64::from(height));
    let fitted_width = (f64::from(width) * scale).round() as u32;
    let fitted_height = (f64::from(height) * scale).round() as u32;
    (fitted_width.clamp(1, max_width.max(1)), fitted_height.clamp(1, max_height.max(1)))
}
