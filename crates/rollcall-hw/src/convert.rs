//! Raw capture buffer to RGB conversion.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("short {format} buffer: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("mjpeg decode: {0}")]
    Mjpeg(#[from] image::ImageError),
}

fn check(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YUV to RGB.
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [clamp(c + 1.596 * e), clamp(c - 0.392 * d - 0.813 * e), clamp(c + 2.017 * d)]
}

/// Packed YUYV 4:2:2, two pixels per `[Y0, U, Y1, V]`.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    let expected = (width * height * 2) as usize;
    check("YUYV", buf, expected)?;

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for quad in buf[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        out.extend_from_slice(&yuv_pixel(y0, u, v));
        out.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    from_raw(width, height, out, "YUYV")
}

/// 8-bit greyscale, replicated into all three channels.
pub fn grey_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    let pixels = (width * height) as usize;
    check("GREY", buf, pixels)?;
    let out = buf[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    from_raw(width, height, out, "GREY")
}

/// Packed 24-bit RGB.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    let expected = (width * height * 3) as usize;
    check("RGB3", buf, expected)?;
    from_raw(width, height, buf[..expected].to_vec(), "RGB3")
}

/// Motion-JPEG: every buffer is a standalone JPEG.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, ConvertError> {
    let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

fn from_raw(width: u32, height: u32, data: Vec<u8>, format: &'static str) -> Result<RgbImage, ConvertError> {
    let actual = data.len();
    RgbImage::from_raw(width, height, data).ok_or(ConvertError::ShortBuffer {
        format,
        expected: (width * height * 3) as usize,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        // Y=16 is black, Y=235 is white in limited range
        let img = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_shares_chroma_between_pair() {
        let img = yuyv_to_rgb(&[120, 90, 120, 200, 60, 128, 60, 128], 4, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0), img.get_pixel(1, 0));
        assert_ne!(img.get_pixel(0, 0), img.get_pixel(2, 0));
        // red-shifted: V above neutral
        let p = img.get_pixel(0, 0).0;
        assert!(p[0] > p[2]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_to_rgb(&[100, 128], 2, 1).unwrap_err();
        assert!(matches!(err, ConvertError::ShortBuffer { expected: 4, actual: 2, .. }));
    }

    #[test]
    fn test_grey_replicates_channels() {
        let img = grey_to_rgb(&[0, 7, 255, 42], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [7, 7, 7]);
        assert_eq!(img.get_pixel(1, 1).0, [42, 42, 42]);
    }

    #[test]
    fn test_rgb24_ignores_trailing_bytes() {
        let img = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6, 99], 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);
    }

    #[test]
    fn test_mjpeg_garbage_is_error() {
        assert!(mjpeg_to_rgb(b"not a jpeg").is_err());
    }
}
