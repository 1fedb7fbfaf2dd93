//! Frame type and pixel handling: YUYV/GREY to RGB, JPEG coding, annotation.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use std::path::Path;
use std::time::Instant;
use vigil_core::BoundingBox;

/// Colour used to outline detected faces.
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const JPEG_QUALITY: u8 = 90;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Decode a JPEG buffer into a frame.
    pub fn from_jpeg(bytes: &[u8], sequence: u32) -> Result<Self, FrameError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8();
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        encode_jpeg(&self.image)
    }

    /// Write the frame as a JPEG file.
    pub fn save_jpeg(&self, path: &Path) -> Result<(), FrameError> {
        std::fs::write(path, self.to_jpeg()?)?;
        Ok(())
    }

    /// Copy of the frame with every face outlined.
    pub fn annotated(&self, faces: &[BoundingBox], padding: u32) -> RgbImage {
        let mut image = self.image.clone();
        for face in faces {
            draw_box(&mut image, face, padding, BOX_COLOR);
        }
        image
    }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}

/// Outline `face` grown by `padding` pixels on every side, clamped to the image.
pub fn draw_box(image: &mut RgbImage, face: &BoundingBox, padding: u32, color: Rgb<u8>) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let pad = padding as f32;
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;

    let x0 = (face.x - pad).clamp(0.0, max_x) as u32;
    let y0 = (face.y - pad).clamp(0.0, max_y) as u32;
    let x1 = (face.x + face.width + pad).clamp(0.0, max_x) as u32;
    let y1 = (face.y + face.height + pad).clamp(0.0, max_y) as u32;
    if x1 < x0 || y1 < y0 {
        return;
    }

    for t in 0..BOX_THICKNESS {
        let (top, bottom) = ((y0 + t).min(y1), y1.saturating_sub(t).max(y0));
        let (left, right) = ((x0 + t).min(x1), x1.saturating_sub(t).max(x0));
        for x in x0..=x1 {
            image.put_pixel(x, top, color);
            image.put_pixel(x, bottom, color);
        }
        for y in y0..=y1 {
            image.put_pixel(left, y, color);
            image.put_pixel(right, y, color);
        }
    }
}

/// Convert packed YUYV (4:2:2) to interleaved RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair. Conversion uses BT.601 limited-range coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb = gray[..expected].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [to_u8(r), to_u8(g), to_u8(b)]
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image coding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
