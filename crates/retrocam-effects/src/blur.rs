use crate::Canvas;

const TAPS: i32 = 30;

/// Discrete kernel equivalent to sampling 61 linearly interpolated taps at
/// `radius * t / 30` with triangle weights `1 - |t / 30|`.
struct Kernel {
    first_offset: i64,
    weights: Vec<f32>,
}

impl Kernel {
    fn triangle(radius: f32) -> Self {
        let first_offset = (-radius).floor() as i64;
        let last_offset = radius.floor() as i64 + 1;
        let mut weights = vec![0f32; (last_offset - first_offset + 1) as usize];
        let mut total = 0f32;
        for t in -TAPS..=TAPS {
            let percent = t as f32 / TAPS as f32;
            let weight = 1.0 - percent.abs();
            let position = radius * percent;
            let base = position.floor();
            let frac = position - base;
            let index = (base as i64 - first_offset) as usize;
            weights[index] += weight * (1.0 - frac);
            if frac > 0.0 {
                weights[index + 1] += weight * frac;
            }
            total += weight;
        }
        for w in &mut weights {
            *w /= total;
        }
        Self { first_offset, weights }
    }
}

pub(crate) fn triangle_blur(canvas: &mut Canvas, radius: f32) {
    if radius <= 0.0 {
        return;
    }
    let kernel = Kernel::triangle(radius);
    let (width, height) = (canvas.width, canvas.height);

    let mut horizontal = vec![[0f32; 3]; canvas.rgb.len()];
    for y in 0..height {
        let row = &canvas.rgb[y * width..(y + 1) * width];
        for x in 0..width {
            horizontal[y * width + x] = convolve(&kernel, x, width, |i| row[i]);
        }
    }

    for x in 0..width {
        for y in 0..height {
            canvas.rgb[y * width + x] = convolve(&kernel, y, height, |i| horizontal[i * width + x]);
        }
    }
}

fn convolve(kernel: &Kernel, center: usize, len: usize, sample: impl Fn(usize) -> [f32; 3]) -> [f32; 3] {
    let last = len as i64 - 1;
    let mut acc = [0f32; 3];
    for (k, weight) in kernel.weights.iter().enumerate() {
        if *weight == 0.0 {
            continue;
        }
        let index = (center as i64 + kernel.first_offset + k as i64).clamp(0, last) as usize;
        let px = sample(index);
        acc[0] += px[0] * weight;
        acc[1] += px[1] * weight;
        acc[2] += px[2] * weight;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(width: usize, height: usize, fill: [f32; 3]) -> Canvas {
        Canvas {
            width,
            height,
            rgb: vec![fill; width * height],
        }
    }

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let kernel = Kernel::triangle(2.0);
        let sum: f32 = kernel.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(kernel.first_offset, -2);
        let w = &kernel.weights;
        assert!((w[0] - w[4]).abs() < 1e-6);
        assert!((w[1] - w[3]).abs() < 1e-6);
        assert!(w[2] > w[1] && w[1] > w[0]);
    }

    #[test]
    fn flat_canvas_is_unchanged() {
        let mut flat = canvas(9, 7, [0.25, 0.5, 0.75]);
        triangle_blur(&mut flat, 2.0);
        for px in &flat.rgb {
            assert!((px[0] - 0.25).abs() < 1e-5);
            assert!((px[1] - 0.5).abs() < 1e-5);
            assert!((px[2] - 0.75).abs() < 1e-5);
        }
    }

    #[test]
    fn point_spreads_within_radius() {
        let mut dot = canvas(11, 11, [0.0; 3]);
        dot.rgb[5 * 11 + 5] = [1.0; 3];
        triangle_blur(&mut dot, 2.0);
        let at = |x: usize, y: usize| dot.rgb[y * 11 + x][0];
        assert!(at(5, 5) < 1.0 && at(5, 5) > 0.0);
        assert!((at(4, 5) - at(6, 5)).abs() < 1e-6);
        assert!((at(5, 4) - at(5, 6)).abs() < 1e-6);
        assert_eq!(at(8, 5), 0.0);
        let energy: f32 = dot.rgb.iter().map(|p| p[0]).sum();
        assert!((energy - 1.0).abs() < 1e-4);
    }

    #[test]
    fn non_positive_radius_is_a_no_op() {
        let mut image = canvas(3, 3, [0.0; 3]);
        image.rgb[4] = [1.0; 3];
        let before = image.rgb.clone();
        triangle_blur(&mut image, 0.0);
        assert_eq!(image.rgb, before);
    }
}
