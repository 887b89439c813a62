//! Frame type and pixel conversion to RGB, plus downscaling.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: std::time::Instant,
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 limited-range YCbCr to RGB.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> Rgb<u8> {
    let y = 1.164 * (y as f32 - 16.0);
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    Rgb([
        clamp_u8(y + 1.596 * cr),
        clamp_u8(y - 0.392 * cb - 0.813 * cr),
        clamp_u8(y + 2.017 * cb),
    ])
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height).div_ceil(2) as usize * 4;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let index = (y * width + x) as usize;
        let pair = index / 2 * 4;
        let luma = yuyv[pair + (index % 2) * 2];
        ycbcr_to_rgb(luma, yuyv[pair + 1], yuyv[pair + 3])
    }))
}

/// Replicate an 8-bit grayscale buffer into RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = grey[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// Copy a packed RGB24 buffer into an image.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    RgbImage::from_raw(width, height, buf[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })
}

/// Decode a Motion-JPEG frame.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8())
}

/// Shrink an image by `factor` (`0 < factor <= 1`) for faster detection.
///
/// A factor of 1 or more returns an unscaled copy.
pub fn downscale(image: &RgbImage, factor: f32) -> RgbImage {
    if factor >= 1.0 {
        return image.clone();
    }
    let w = ((image.width() as f32 * factor).round() as u32).max(1);
    let h = ((image.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}
