//! JPEG encode/decode and the "no video" placeholder.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, Rgb, RgbImage};
use std::sync::OnceLock;
use thiserror::Error;

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

const GLYPH_SCALE: u32 = 8;
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot encode empty {0}x{1} image")]
    EmptyImage(u32, u32),
    #[error("jpeg codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// Compress an RGB image to JPEG at `quality` (clamped to 1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyImage(width, height));
    }
    let mut out = Vec::with_capacity((width * height / 8) as usize);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode(image.as_raw(), width, height, ExtendedColorType::Rgb8)?;
    Ok(out)
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, EncodeError> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
    Ok(image.into_rgb8())
}

/// Fixed 640x480 frame served to pull consumers while no capture is available.
pub fn placeholder_image() -> &'static RgbImage {
    static PLACEHOLDER: OnceLock<RgbImage> = OnceLock::new();
    PLACEHOLDER.get_or_init(render_placeholder)
}

fn render_placeholder() -> RgbImage {
    let mut image = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, Rgb([0, 0, 0]));
    let text = "NO VIDEO";
    let advance = (GLYPH_W + 1) * GLYPH_SCALE;
    let text_w = advance * text.len() as u32 - GLYPH_SCALE;
    let origin_x = (PLACEHOLDER_WIDTH - text_w) / 2;
    let origin_y = (PLACEHOLDER_HEIGHT - GLYPH_H * GLYPH_SCALE) / 2;

    for (i, ch) in text.chars().enumerate() {
        let rows = glyph(ch);
        let glyph_x = origin_x + i as u32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                let x0 = glyph_x + col * GLYPH_SCALE;
                let y0 = origin_y + row as u32 * GLYPH_SCALE;
                for y in y0..y0 + GLYPH_SCALE {
                    for x in x0..x0 + GLYPH_SCALE {
                        image.put_pixel(x, y, Rgb([255, 255, 255]));
                    }
                }
            }
        }
    }
    image
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        _ => [0; 7],
    }
}
