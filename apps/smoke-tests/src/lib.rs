//! Fixture builders shared by the end-to-end conformance tests.

use std::io::Cursor;

use anyhow::Result;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, RgbaImage};

/// A gradient PNG with an opaque alpha channel.
pub fn sample_png(width: u32, height: u32) -> Result<Vec<u8>> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 120, 255])
    });
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

/// A checkerboard JPEG, the typical camera input.
pub fn sample_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            Rgb([230, 210, 180])
        } else {
            Rgb([40, 60, 90])
        }
    });
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

fn encode(img: DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), format)?;
    Ok(out)
}
