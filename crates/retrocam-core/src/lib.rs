use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use retrocam_image::{ImageSize, ResizeError, ResizePlan, ResizeRequest};

mod config;
mod effects;

pub use config::{
    output_format_label, parse_output_format, parse_resample_filter, resample_filter_label, resolve_pipeline_config,
    PipelineConfig, PipelineSettings, DEFAULT_MAX_DECODED_PIXELS, DEFAULT_QUALITY,
};
pub use effects::{parse_effect_chain, validate_chain, vintage_chain, EffectOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleFilter {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    Read,
    Decode,
    Plan,
    Resample,
    Effects,
    Encode,
}

impl PipelineStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Decode => "decode",
            Self::Plan => "plan",
            Self::Resample => "resample",
            Self::Effects => "effects",
            Self::Encode => "encode",
        }
    }
}

/// Tightly packed RGBA8 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, CoreError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| CoreError::ResourceLimit(format!("{}x{} buffer overflows usize", width, height)))?;
        if rgba.len() != expected {
            return Err(CoreError::InvalidRequest(format!(
                "pixel buffer length {} does not match {}x{} rgba ({} bytes)",
                rgba.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, rgba })
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct SourceImage {
    pub format: Option<String>,
    pub pixels: PixelBuffer,
}

impl SourceImage {
    pub fn size(&self) -> ImageSize {
        self.pixels.size()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedBlob {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input_bytes: Vec<u8>,
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub blob: EncodedBlob,
    pub plan: ResizePlan,
    pub source_format: Option<String>,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    PipelineStart,
    StageSuccess,
    PipelineSuccess,
    PipelineError,
    PipelineCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub stage: Option<PipelineStage>,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Decode, resample and encode collaborator.
pub trait ImageBackend: Send + Sync {
    fn decode(&self, bytes: &[u8], max_decoded_pixels: u64) -> Result<SourceImage, CoreError>;
    fn resample(&self, source: &SourceImage, target: ImageSize, filter: ResampleFilter) -> Result<PixelBuffer, CoreError>;
    fn encode(&self, pixels: &PixelBuffer, format: OutputFormat, quality: u8) -> Result<EncodedBlob, CoreError>;
}

/// Applies an ordered effect chain; output has the input's dimensions.
pub trait EffectsBackend: Send + Sync {
    fn apply(&self, pixels: PixelBuffer, chain: &[EffectOp], seed: u64) -> Result<PixelBuffer, CoreError>;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read input: {0}")]
    Read(String),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("invalid image dimensions {width}x{height}")]
    InvalidImageDimensions { width: u32, height: u32 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("effects failed: {0}")]
    Effects(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("{} stage timed out after {:?}", .stage.label(), .after)]
    Timeout { stage: PipelineStage, after: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ResizeError> for CoreError {
    fn from(err: ResizeError) -> Self {
        match err {
            ResizeError::InvalidImageDimensions { width, height } => Self::InvalidImageDimensions { width, height },
            ResizeError::InvalidRequest(message) => Self::InvalidRequest(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ReadError,
    DecodeError,
    InvalidImageDimensions,
    InvalidRequest,
    ResourceLimit,
    EffectsError,
    EncodeError,
    Cancelled,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read(_) => ErrorCode::ReadError,
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::InvalidImageDimensions { .. } => ErrorCode::InvalidImageDimensions,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::ResourceLimit(_) => ErrorCode::ResourceLimit,
            Self::Effects(_) => ErrorCode::EffectsError,
            Self::Encode(_) => ErrorCode::EncodeError,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Seed used for noise when the caller does not pin one.
pub fn default_seed(size: ImageSize) -> u64 {
    (size.width as u64).wrapping_mul(size.height as u64).wrapping_add(12_345)
}

pub mod v1 {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProcessRequest {
        pub image_bytes: Vec<u8>,
        pub target_pixels: Option<u64>,
        pub max_dimension: Option<u32>,
        pub output_format: Option<String>,
        pub quality: Option<u8>,
        pub resample_filter: Option<String>,
        pub seed: Option<u64>,
        pub effects: Option<Vec<EffectOp>>,
        pub stage_timeout_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProcessResponse {
        pub image_bytes: Vec<u8>,
        pub mime_type: String,
        pub quality: u8,
        pub source_width: u32,
        pub source_height: u32,
        pub width: u32,
        pub height: u32,
        pub scale_factor: f64,
        pub clamped: bool,
    }

    impl ProcessRequest {
        pub fn into_pipeline_request(self) -> Result<PipelineRequest, CoreError> {
            let defaults = PipelineConfig::default();
            let config = resolve_pipeline_config(PipelineConfig {
                target_pixels: self.target_pixels.unwrap_or(defaults.target_pixels),
                max_dimension: self.max_dimension.unwrap_or(defaults.max_dimension),
                output_format: self.output_format.unwrap_or_default(),
                quality: self.quality.unwrap_or(defaults.quality),
                resample_filter: self.resample_filter.unwrap_or_default(),
                seed: self.seed,
                stage_timeout_ms: self.stage_timeout_ms,
                max_decoded_pixels: defaults.max_decoded_pixels,
            });
            let mut settings = config.into_settings()?;
            if let Some(chain) = self.effects {
                validate_chain(&chain)?;
                settings.chain = chain;
            }
            Ok(PipelineRequest {
                input_bytes: self.image_bytes,
                settings,
            })
        }
    }

    impl From<PipelineOutput> for ProcessResponse {
        fn from(output: PipelineOutput) -> Self {
            Self {
                mime_type: output.blob.format.mime_type().to_string(),
                quality: output.blob.quality,
                source_width: output.plan.source.width,
                source_height: output.plan.source.height,
                width: output.blob.width,
                height: output.blob.height,
                scale_factor: output.plan.scale_factor,
                clamped: output.plan.clamped,
                image_bytes: output.blob.bytes,
            }
        }
    }
}

/// Plans the output size, rejecting outputs above `max_decoded_pixels`.
pub fn plan_for(source: ImageSize, settings: &PipelineSettings) -> Result<ResizePlan, CoreError> {
    let plan = retrocam_image::plan_resize(source, &settings.resize)?;
    if plan.target.pixels() > settings.max_decoded_pixels {
        return Err(CoreError::ResourceLimit(format!(
            "output {}x{} has {} pixels (limit: {} pixels)",
            plan.target.width,
            plan.target.height,
            plan.target.pixels(),
            settings.max_decoded_pixels
        )));
    }
    Ok(plan)
}
