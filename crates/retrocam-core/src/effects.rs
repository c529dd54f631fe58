use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const MAX_BLUR_RADIUS: f32 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum EffectOp {
    BrightnessContrast { brightness: f32, contrast: f32 },
    HueSaturation { hue: f32, saturation: f32 },
    Noise { amount: f32 },
    TriangleBlur { radius: f32 },
}

impl EffectOp {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BrightnessContrast { .. } => "brightness-contrast",
            Self::HueSaturation { .. } => "hue-saturation",
            Self::Noise { .. } => "noise",
            Self::TriangleBlur { .. } => "triangle-blur",
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match *self {
            Self::BrightnessContrast { brightness, contrast } => {
                check_range(self, "brightness", brightness, -1.0, 1.0)?;
                check_range(self, "contrast", contrast, -1.0, 1.0)
            }
            Self::HueSaturation { hue, saturation } => {
                check_range(self, "hue", hue, -1.0, 1.0)?;
                check_range(self, "saturation", saturation, -1.0, 1.0)
            }
            Self::Noise { amount } => check_range(self, "amount", amount, 0.0, 1.0),
            Self::TriangleBlur { radius } => check_range(self, "radius", radius, 0.0, MAX_BLUR_RADIUS),
        }
    }
}

fn check_range(op: &EffectOp, name: &str, value: f32, min: f32, max: f32) -> Result<(), CoreError> {
    if !value.is_finite() || value < min || value > max {
        return Err(CoreError::InvalidRequest(format!(
            "{} {} must be within {}..={} (received: {})",
            op.label(),
            name,
            min,
            max,
            value
        )));
    }
    Ok(())
}

/// The fixed early-phone-camera look: slightly darker and flatter, more
/// saturated, grainy and soft.
pub fn vintage_chain() -> Vec<EffectOp> {
    vec![
        EffectOp::BrightnessContrast {
            brightness: -0.05,
            contrast: -0.05,
        },
        EffectOp::HueSaturation {
            hue: 0.0,
            saturation: 0.2,
        },
        EffectOp::Noise { amount: 0.1 },
        EffectOp::TriangleBlur { radius: 2.0 },
    ]
}

pub fn validate_chain(chain: &[EffectOp]) -> Result<(), CoreError> {
    chain.iter().try_for_each(EffectOp::validate)
}

/// Reads a JSON array of operations, e.g. `[{"op":"noise","amount":0.1}]`.
pub fn parse_effect_chain(json: &str) -> Result<Vec<EffectOp>, CoreError> {
    let chain: Vec<EffectOp> =
        serde_json::from_str(json).map_err(|e| CoreError::InvalidRequest(format!("invalid effect chain: {}", e)))?;
    validate_chain(&chain)?;
    Ok(chain)
}
