use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{vintage_chain, CoreError, EffectOp, OutputFormat, ResampleFilter, ResizeRequest};

pub const DEFAULT_QUALITY: u8 = 100;
pub const DEFAULT_MAX_DECODED_PIXELS: u64 = 100_000_000;

/// Loosely typed pipeline configuration, as it arrives from flags or hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub target_pixels: u64,
    pub max_dimension: u32,
    pub output_format: String,
    pub quality: u8,
    pub resample_filter: String,
    pub seed: Option<u64>,
    pub stage_timeout_ms: Option<u64>,
    pub max_decoded_pixels: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let resize = ResizeRequest::default();
        Self {
            target_pixels: resize.target_pixels,
            max_dimension: resize.max_dimension,
            output_format: "jpeg".to_string(),
            quality: DEFAULT_QUALITY,
            resample_filter: "bilinear".to_string(),
            seed: None,
            stage_timeout_ms: None,
            max_decoded_pixels: DEFAULT_MAX_DECODED_PIXELS,
        }
    }
}

pub fn resolve_pipeline_config(overrides: PipelineConfig) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    if !overrides.output_format.trim().is_empty() {
        cfg.output_format = overrides.output_format;
    }
    if !overrides.resample_filter.trim().is_empty() {
        cfg.resample_filter = overrides.resample_filter;
    }
    if overrides.max_decoded_pixels > 0 {
        cfg.max_decoded_pixels = overrides.max_decoded_pixels;
    }
    cfg.target_pixels = overrides.target_pixels;
    cfg.max_dimension = overrides.max_dimension;
    cfg.quality = overrides.quality;
    cfg.seed = overrides.seed;
    cfg.stage_timeout_ms = overrides.stage_timeout_ms.filter(|ms| *ms > 0);
    cfg
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub resize: ResizeRequest,
    pub format: OutputFormat,
    pub quality: u8,
    pub filter: ResampleFilter,
    pub seed: Option<u64>,
    pub chain: Vec<EffectOp>,
    pub stage_timeout: Option<Duration>,
    pub max_decoded_pixels: u64,
}

impl PipelineConfig {
    /// Parses the string-typed fields; the effect chain starts as the vintage chain.
    pub fn into_settings(self) -> Result<PipelineSettings, CoreError> {
        if !(1..=100).contains(&self.quality) {
            return Err(CoreError::InvalidRequest(format!(
                "quality must be within 1..=100 (received: {})",
                self.quality
            )));
        }
        Ok(PipelineSettings {
            resize: ResizeRequest {
                target_pixels: self.target_pixels,
                max_dimension: self.max_dimension,
            },
            format: parse_output_format(&self.output_format)?,
            quality: self.quality,
            filter: parse_resample_filter(&self.resample_filter)?,
            seed: self.seed,
            chain: vintage_chain(),
            stage_timeout: self.stage_timeout_ms.map(Duration::from_millis),
            max_decoded_pixels: self.max_decoded_pixels,
        })
    }
}

pub fn parse_output_format(value: &str) -> Result<OutputFormat, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
        "png" => Ok(OutputFormat::Png),
        other => Err(CoreError::InvalidRequest(format!(
            "unknown output format '{}'; expected one of: jpeg, png",
            other
        ))),
    }
}

pub fn output_format_label(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Jpeg => "jpeg",
        OutputFormat::Png => "png",
    }
}

pub fn parse_resample_filter(value: &str) -> Result<ResampleFilter, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "nearest" => Ok(ResampleFilter::Nearest),
        "bilinear" | "triangle" => Ok(ResampleFilter::Bilinear),
        "bicubic" | "catmull-rom" => Ok(ResampleFilter::Bicubic),
        "lanczos3" | "lanczos" => Ok(ResampleFilter::Lanczos3),
        other => Err(CoreError::InvalidRequest(format!(
            "unknown resample filter '{}'; expected one of: nearest, bilinear, bicubic, lanczos3",
            other
        ))),
    }
}

pub fn resample_filter_label(filter: ResampleFilter) -> &'static str {
    match filter {
        ResampleFilter::Nearest => "nearest",
        ResampleFilter::Bilinear => "bilinear",
        ResampleFilter::Bicubic => "bicubic",
        ResampleFilter::Lanczos3 => "lanczos3",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_strings_fall_back_to_defaults() {
        let cfg = resolve_pipeline_config(PipelineConfig {
            output_format: "  ".to_string(),
            resample_filter: String::new(),
            max_decoded_pixels: 0,
            stage_timeout_ms: Some(0),
            ..PipelineConfig::default()
        });
        assert_eq!(cfg.output_format, "jpeg");
        assert_eq!(cfg.resample_filter, "bilinear");
        assert_eq!(cfg.max_decoded_pixels, DEFAULT_MAX_DECODED_PIXELS);
        assert_eq!(cfg.stage_timeout_ms, None);
    }

    #[test]
    fn defaults_describe_maximum_quality_jpeg() {
        let settings = PipelineConfig::default().into_settings().expect("defaults should parse");
        assert_eq!(settings.format, OutputFormat::Jpeg);
        assert_eq!(settings.quality, 100);
        assert_eq!(settings.filter, ResampleFilter::Bilinear);
        assert_eq!(settings.resize.target_pixels, 3_000_000);
        assert_eq!(settings.chain, vintage_chain());
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        let err = PipelineConfig {
            quality: 0,
            ..PipelineConfig::default()
        }
        .into_settings()
        .expect_err("quality 0 must fail");
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn parses_aliases() {
        assert_eq!(parse_output_format("JPG").expect("alias should parse"), OutputFormat::Jpeg);
        assert_eq!(
            parse_resample_filter("catmull-rom").expect("alias should parse"),
            ResampleFilter::Bicubic
        );
        assert!(parse_output_format("gif").is_err());
    }

    #[test]
    fn filter_labels_parse_back() {
        for filter in [
            ResampleFilter::Nearest,
            ResampleFilter::Bilinear,
            ResampleFilter::Bicubic,
            ResampleFilter::Lanczos3,
        ] {
            let label = resample_filter_label(filter);
            assert_eq!(parse_resample_filter(label).expect("label should parse"), filter);
        }
    }
}
