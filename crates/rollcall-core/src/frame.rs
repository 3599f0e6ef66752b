//! Frame type and the image operations the pipeline needs: downscale, crop, JPEG.

use crate::types::FaceRegion;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// A captured RGB camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-device frame number.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame: {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when the frame has no pixels (corrupt or truncated capture).
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Resize by `scale` (clamped to (0, 1]) with a triangle filter.
    ///
    /// A scale of 1.0 or an empty frame returns a plain copy.
    pub fn downscale(&self, scale: f32) -> Frame {
        let scale = if scale.is_finite() { scale.clamp(0.01, 1.0) } else { 1.0 };
        if scale >= 1.0 || self.is_empty() {
            return self.clone();
        }

        let w = ((self.width() as f32 * scale).round() as u32).max(1);
        let h = ((self.height() as f32 * scale).round() as u32).max(1);

        Frame {
            image: imageops::resize(&self.image, w, h, FilterType::Triangle),
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    /// Crop a face region grown by `margin` pixels on every side, clamped to
    /// the frame bounds. Returns `None` if nothing of the region lies inside
    /// the frame.
    pub fn crop(&self, face: &FaceRegion, margin: u32) -> Option<RgbImage> {
        let margin = margin as f32;
        let fw = self.width() as f32;
        let fh = self.height() as f32;

        let left = (face.x - margin).max(0.0).floor();
        let top = (face.y - margin).max(0.0).floor();
        let right = (face.right() + margin).min(fw).ceil();
        let bottom = (face.bottom() + margin).min(fh).ceil();

        if right <= left || bottom <= top {
            return None;
        }

        let crop = imageops::crop_imm(
            &self.image,
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        );
        Some(crop.to_image())
    }

    /// Encode as baseline JPEG for streaming.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.is_empty() {
            return Err(FrameError::InvalidFrame {
                width: self.width(),
                height: self.height(),
            });
        }

        let mut out = Vec::with_capacity((self.width() * self.height()) as usize / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode_image(&self.image)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(RgbImage::from_pixel(w, h, Rgb([120, 80, 40])), 0)
    }

    #[test]
    fn test_downscale_halves_dimensions() {
        let small = frame(640, 480).downscale(0.5);
        assert_eq!((small.width(), small.height()), (320, 240));
    }

    #[test]
    fn test_downscale_full_scale_is_copy() {
        let f = frame(64, 48);
        let same = f.downscale(1.0);
        assert_eq!((same.width(), same.height()), (64, 48));
    }

    #[test]
    fn test_crop_clamps_margin_to_bounds() {
        let f = frame(200, 100);
        let face = FaceRegion::new(10.0, 10.0, 40.0, 40.0);
        let crop = f.crop(&face, 50).unwrap();
        // left/top clamp to 0, right = 100, bottom clamps to 100
        assert_eq!((crop.width(), crop.height()), (100, 100));
    }

    #[test]
    fn test_crop_interior() {
        let f = frame(400, 400);
        let face = FaceRegion::new(100.0, 100.0, 50.0, 60.0);
        let crop = f.crop(&face, 10).unwrap();
        assert_eq!((crop.width(), crop.height()), (70, 80));
    }

    #[test]
    fn test_crop_outside_frame() {
        let f = frame(100, 100);
        let face = FaceRegion::new(300.0, 300.0, 20.0, 20.0);
        assert!(f.crop(&face, 0).is_none());
    }

    #[test]
    fn test_encode_jpeg_produces_soi_marker() {
        let jpeg = frame(32, 32).encode_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_empty_frame_fails() {
        let f = Frame::new(RgbImage::new(0, 0), 0);
        assert!(matches!(f.encode_jpeg(80), Err(FrameError::InvalidFrame { .. })));
    }
}
