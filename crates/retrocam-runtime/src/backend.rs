use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageFormat, ImageReader, RgbaImage};
use retrocam_core::{CoreError, EncodedBlob, ImageBackend, ImageSize, OutputFormat, PixelBuffer, ResampleFilter, SourceImage};

/// Decode, resample and encode with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalImageBackend;

impl ImageBackend for LocalImageBackend {
    fn decode(&self, bytes: &[u8], max_decoded_pixels: u64) -> Result<SourceImage, CoreError> {
        let format = image::guess_format(bytes).map_err(|e| CoreError::Decode(format!("unsupported image format: {}", e)))?;
        let mut decoder = ImageReader::with_format(Cursor::new(bytes), format)
            .into_decoder()
            .map_err(|e| CoreError::Decode(format!("failed to read image header: {}", e)))?;
        let (width, height) = decoder.dimensions();
        let declared = ImageSize::new(width, height);
        if declared.pixels() == 0 {
            return Err(CoreError::InvalidImageDimensions { width, height });
        }
        if declared.pixels() > max_decoded_pixels {
            return Err(CoreError::ResourceLimit(format!(
                "image has {} pixels (limit: {} pixels)",
                declared.pixels(),
                max_decoded_pixels
            )));
        }

        // Camera JPEGs store the sensor layout and an EXIF rotation.
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let mut decoded = DynamicImage::from_decoder(decoder).map_err(|e| CoreError::Decode(e.to_string()))?;
        decoded.apply_orientation(orientation);
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        log::debug!("decoded {}x{} {}", width, height, format_label(format));
        Ok(SourceImage {
            format: Some(format_label(format).to_string()),
            pixels: PixelBuffer::new(width, height, rgba.into_raw())?,
        })
    }

    fn resample(&self, source: &SourceImage, target: ImageSize, filter: ResampleFilter) -> Result<PixelBuffer, CoreError> {
        if target.pixels() == 0 {
            return Err(CoreError::InvalidImageDimensions {
                width: target.width,
                height: target.height,
            });
        }
        let pixels = &source.pixels;
        let image = RgbaImage::from_raw(pixels.width, pixels.height, pixels.rgba.clone())
            .ok_or_else(|| CoreError::Internal("source buffer does not match its dimensions".to_string()))?;
        let resized = if image.dimensions() == (target.width, target.height) {
            image
        } else {
            image::imageops::resize(&image, target.width, target.height, to_filter_type(filter))
        };
        PixelBuffer::new(target.width, target.height, resized.into_raw())
    }

    fn encode(&self, pixels: &PixelBuffer, format: OutputFormat, quality: u8) -> Result<EncodedBlob, CoreError> {
        if pixels.width == 0 || pixels.height == 0 {
            return Err(CoreError::Encode(format!(
                "cannot encode a {}x{} buffer",
                pixels.width, pixels.height
            )));
        }
        let image = RgbaImage::from_raw(pixels.width, pixels.height, pixels.rgba.clone())
            .ok_or_else(|| CoreError::Encode("pixel buffer does not match its dimensions".to_string()))?;

        let mut bytes = Vec::new();
        match format {
            OutputFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
                JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
                    .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
                    .map_err(|e| CoreError::Encode(e.to_string()))?;
            }
            OutputFormat::Png => {
                PngEncoder::new(&mut bytes)
                    .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgba8)
                    .map_err(|e| CoreError::Encode(e.to_string()))?;
            }
        }

        Ok(EncodedBlob {
            bytes,
            format,
            quality,
            width: pixels.width,
            height: pixels.height,
        })
    }
}

fn to_filter_type(filter: ResampleFilter) -> FilterType {
    match filter {
        ResampleFilter::Nearest => FilterType::Nearest,
        ResampleFilter::Bilinear => FilterType::Triangle,
        ResampleFilter::Bicubic => FilterType::CatmullRom,
        ResampleFilter::Lanczos3 => FilterType::Lanczos3,
    }
}

fn format_label(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("unknown")
}
