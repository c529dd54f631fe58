use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TARGET_PIXELS: u64 = 3_000_000;
pub const DEFAULT_MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        (self.width as u64).saturating_mul(self.height as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub target_pixels: u64,
    pub max_dimension: u32,
}

impl Default for ResizeRequest {
    fn default() -> Self {
        Self {
            target_pixels: DEFAULT_TARGET_PIXELS,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Output dimensions for one source image.
///
/// `clamped` is set when `max_dimension` overrode the pixel budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePlan {
    pub source: ImageSize,
    pub target: ImageSize,
    pub scale_factor: f64,
    pub clamped: bool,
}

impl ResizePlan {
    pub fn is_upscale(&self) -> bool {
        self.scale_factor > 1.0
    }

    /// Relative drift between the realized pixel count and the requested budget.
    pub fn pixel_error(&self, target_pixels: u64) -> f64 {
        if target_pixels == 0 {
            return 0.0;
        }
        (self.target.pixels() as f64 - target_pixels as f64).abs() / target_pixels as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResizeError {
    #[error("invalid image dimensions {width}x{height}")]
    InvalidImageDimensions { width: u32, height: u32 },
    #[error("invalid resize request: {0}")]
    InvalidRequest(String),
}

pub fn plan_resize(source: ImageSize, request: &ResizeRequest) -> Result<ResizePlan, ResizeError> {
    if request.target_pixels == 0 {
        return Err(ResizeError::InvalidRequest("target pixels must be positive".to_string()));
    }
    if request.max_dimension == 0 {
        return Err(ResizeError::InvalidRequest("max dimension must be positive".to_string()));
    }
    let source_pixels = source.pixels();
    if source_pixels == 0 {
        return Err(ResizeError::InvalidImageDimensions {
            width: source.width,
            height: source.height,
        });
    }

    let mut scale_factor = (request.target_pixels as f64 / source_pixels as f64).sqrt();
    if !scale_factor.is_finite() || scale_factor <= 0.0 {
        return Err(ResizeError::InvalidImageDimensions {
            width: source.width,
            height: source.height,
        });
    }

    let mut width = scaled_dimension(source.width, scale_factor);
    let mut height = scaled_dimension(source.height, scale_factor);
    let limit = request.max_dimension as f64;
    let clamped = width > limit || height > limit;
    if clamped {
        scale_factor = limit / source.width.max(source.height) as f64;
        width = scaled_dimension(source.width, scale_factor).min(limit);
        height = scaled_dimension(source.height, scale_factor).min(limit);
    }

    Ok(ResizePlan {
        source,
        target: ImageSize {
            width: width as u32,
            height: height as u32,
        },
        scale_factor,
        clamped,
    })
}

fn scaled_dimension(value: u32, scale_factor: f64) -> f64 {
    (value as f64 * scale_factor).round().max(1.0)
}

pub fn estimate_rgba_bytes(size: ImageSize) -> u64 {
    size.pixels().saturating_mul(4)
}
