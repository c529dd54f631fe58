use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use retrocam_core::{validate_chain, CoreError, EffectOp, EffectsBackend, PixelBuffer};

mod blur;

/// Effects computed on the CPU in normalized floats.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEffects;

impl EffectsBackend for CpuEffects {
    fn apply(&self, pixels: PixelBuffer, chain: &[EffectOp], seed: u64) -> Result<PixelBuffer, CoreError> {
        validate_chain(chain)?;
        let (width, height) = (pixels.width, pixels.height);
        let mut image = RgbaImage::from_raw(width, height, pixels.rgba)
            .ok_or_else(|| CoreError::Effects(format!("buffer does not hold {}x{} rgba pixels", width, height)))?;
        apply_chain(&mut image, chain, seed);
        PixelBuffer::new(width, height, image.into_raw())
    }
}

/// Applies `chain` in order. Alpha is left untouched.
pub fn apply_chain(image: &mut RgbaImage, chain: &[EffectOp], seed: u64) {
    if chain.is_empty() || image.width() == 0 || image.height() == 0 {
        return;
    }
    let mut canvas = Canvas::from_image(image);
    let mut rng = StdRng::seed_from_u64(seed);
    for op in chain {
        log::debug!("applying {} to {}x{}", op.label(), canvas.width, canvas.height);
        match *op {
            EffectOp::BrightnessContrast { brightness, contrast } => {
                canvas.map_pixels(|rgb| brightness_contrast(rgb, brightness, contrast))
            }
            EffectOp::HueSaturation { hue, saturation } => canvas.map_pixels(|rgb| hue_saturation(rgb, hue, saturation)),
            EffectOp::Noise { amount } => add_noise(&mut canvas, amount, &mut rng),
            EffectOp::TriangleBlur { radius } => blur::triangle_blur(&mut canvas, radius),
        }
    }
    canvas.write_back(image);
}

/// Working RGB planes in `[0, 1]`, not clamped between operations.
pub(crate) struct Canvas {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) rgb: Vec<[f32; 3]>,
}

impl Canvas {
    fn from_image(image: &RgbaImage) -> Self {
        let rgb = image
            .pixels()
            .map(|p| [to_unit(p[0]), to_unit(p[1]), to_unit(p[2])])
            .collect();
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            rgb,
        }
    }

    fn map_pixels(&mut self, f: impl Fn([f32; 3]) -> [f32; 3]) {
        for px in &mut self.rgb {
            *px = f(*px);
        }
    }

    fn write_back(&self, image: &mut RgbaImage) {
        for (dst, src) in image.pixels_mut().zip(&self.rgb) {
            dst[0] = from_unit(src[0]);
            dst[1] = from_unit(src[1]);
            dst[2] = from_unit(src[2]);
        }
    }
}

fn to_unit(value: u8) -> f32 {
    value as f32 / 255.0
}

fn from_unit(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub(crate) fn brightness_contrast(rgb: [f32; 3], brightness: f32, contrast: f32) -> [f32; 3] {
    rgb.map(|v| {
        let v = v + brightness;
        if contrast > 0.0 {
            (v - 0.5) / (1.0 - contrast) + 0.5
        } else {
            (v - 0.5) * (1.0 + contrast) + 0.5
        }
    })
}

pub(crate) fn hue_saturation(rgb: [f32; 3], hue: f32, saturation: f32) -> [f32; 3] {
    let mut rgb = rgb;
    if hue != 0.0 {
        let angle = hue * std::f32::consts::PI;
        let (s, c) = angle.sin_cos();
        let sqrt3 = 3f32.sqrt();
        let w = [
            (2.0 * c + 1.0) / 3.0,
            (-sqrt3 * s - c + 1.0) / 3.0,
            (sqrt3 * s - c + 1.0) / 3.0,
        ];
        let [r, g, b] = rgb;
        rgb = [
            r * w[0] + g * w[1] + b * w[2],
            r * w[2] + g * w[0] + b * w[1],
            r * w[1] + g * w[2] + b * w[0],
        ];
    }

    let average = (rgb[0] + rgb[1] + rgb[2]) / 3.0;
    let factor = if saturation > 0.0 {
        1.0 - 1.0 / (1.001 - saturation)
    } else {
        -saturation
    };
    rgb.map(|v| v + (average - v) * factor)
}

fn add_noise(canvas: &mut Canvas, amount: f32, rng: &mut StdRng) {
    if amount <= 0.0 {
        return;
    }
    for px in &mut canvas.rgb {
        let diff = (rng.gen::<f32>() - 0.5) * amount;
        for v in px.iter_mut() {
            *v += diff;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use retrocam_core::vintage_chain;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 200])
        })
    }

    fn close(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn brightness_contrast_matches_reference_math() {
        let out = brightness_contrast([0.5, 0.2, 1.0], -0.05, -0.05);
        assert!(close(out, [0.4525, 0.1675, 0.9275]));
        let boosted = brightness_contrast([0.75, 0.5, 0.25], 0.0, 0.5);
        assert!(close(boosted, [1.0, 0.5, 0.0]));
    }

    #[test]
    fn saturation_pushes_away_from_gray() {
        let out = hue_saturation([0.6, 0.5, 0.4], 0.0, 0.2);
        assert!(out[0] > 0.6 && out[2] < 0.4);
        assert!((out[1] - 0.5).abs() < 1e-6);
        let gray = hue_saturation([0.3, 0.3, 0.3], 0.0, 0.2);
        assert!(close(gray, [0.3, 0.3, 0.3]));
        let desaturated = hue_saturation([0.6, 0.5, 0.4], 0.0, -1.0);
        assert!(close(desaturated, [0.5, 0.5, 0.5]));
    }

    #[test]
    fn zero_hue_is_identity_and_full_turn_cycles_channels() {
        assert!(close(hue_saturation([0.9, 0.1, 0.4], 0.0, 0.0), [0.9, 0.1, 0.4]));
        let rotated = hue_saturation([1.0, 0.0, 0.0], 2.0 / 3.0, 0.0);
        assert!(close(rotated, [0.0, 1.0, 0.0]));
    }

    #[test]
    fn chain_preserves_dimensions_and_alpha() {
        let mut image = gradient(31, 17);
        apply_chain(&mut image, &vintage_chain(), 42);
        assert_eq!(image.dimensions(), (31, 17));
        assert!(image.pixels().all(|p| p[3] == 200));
    }

    #[test]
    fn noise_is_deterministic_for_a_seed() {
        let chain = [EffectOp::Noise { amount: 0.5 }];
        let mut a = gradient(16, 16);
        let mut b = gradient(16, 16);
        let mut c = gradient(16, 16);
        apply_chain(&mut a, &chain, 7);
        apply_chain(&mut b, &chain, 7);
        apply_chain(&mut c, &chain, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_chain_leaves_pixels_alone() {
        let mut image = gradient(8, 8);
        let before = image.clone();
        apply_chain(&mut image, &[], 1);
        assert_eq!(image, before);
    }

    #[test]
    fn backend_rejects_invalid_chain_before_work() {
        let pixels = PixelBuffer::new(2, 2, vec![10; 16]).expect("buffer should build");
        let err = CpuEffects
            .apply(pixels, &[EffectOp::BrightnessContrast { brightness: 2.0, contrast: 0.0 }], 0)
            .expect_err("brightness 2.0 must fail");
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn backend_returns_same_sized_buffer() {
        let image = gradient(12, 5);
        let pixels = PixelBuffer::new(12, 5, image.into_raw()).expect("buffer should build");
        let out = CpuEffects.apply(pixels, &vintage_chain(), 3).expect("effects should succeed");
        assert_eq!((out.width, out.height), (12, 5));
        assert_eq!(out.rgba.len(), 12 * 5 * 4);
    }
}
