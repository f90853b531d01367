//! Enrollment augmentation: perturbed views of one normalized face.
//!
//! Every variant starts from the same square base image and runs through the
//! transform chain below, each step firing independently with its configured
//! probability. Values are clipped to [0, 1] after every step and no step
//! changes the array shape.

use crate::config::AugmentationConfig;
use crate::normalizer::fit_square;
use crate::types::{clip_unit, FaceTensor};
use ndarray::{s, Array3, ArrayView3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Line directions for motion blur, as (dy, dx) steps.
const BLUR_DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

pub struct AugmentationExpander {
    size: usize,
    config: AugmentationConfig,
}

impl AugmentationExpander {
    pub fn new(size: usize, config: AugmentationConfig) -> Self {
        Self { size, config }
    }

    /// Produce `count` images: the resized/padded original followed by
    /// `count - 1` random variants drawn from `rng`.
    ///
    /// Empty input yields an empty sequence.
    pub fn expand<R: Rng>(
        &self,
        face: ArrayView3<'_, f32>,
        count: usize,
        rng: &mut R,
    ) -> Vec<FaceTensor> {
        if count == 0 {
            return Vec::new();
        }
        let Some(base) = fit_square(face, self.size).and_then(FaceTensor::from_array) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(count);
        out.push(base);
        for _ in 1..count {
            let variant = self.perturb(out[0].view().to_owned(), rng);
            out.extend(FaceTensor::from_array(variant));
        }
        out
    }

    fn perturb<R: Rng>(&self, mut img: Array3<f32>, rng: &mut R) -> Array3<f32> {
        let c = &self.config;

        if fires(rng, c.flip_p) {
            img = flip_horizontal(&img);
        }
        if fires(rng, c.brightness_p) {
            let factor = uniform(rng, c.brightness_range);
            img.mapv_inplace(|v| clip_unit(v * factor));
        }
        if fires(rng, c.rotation_p) {
            let degrees = uniform(rng, (-c.max_rotation_deg, c.max_rotation_deg));
            img = rotate(&img, degrees);
        }
        if fires(rng, c.noise_p) {
            let std = uniform(rng, c.noise_std_range);
            if let Ok(normal) = Normal::new(0.0f32, std) {
                img.mapv_inplace(|v| clip_unit(v + normal.sample(rng)));
            }
        }
        if fires(rng, c.contrast_p) {
            let alpha = 1.0 + uniform(rng, (-c.contrast_limit, c.contrast_limit));
            let beta = uniform(rng, (-c.brightness_limit, c.brightness_limit));
            img.mapv_inplace(|v| clip_unit(v * alpha + beta));
        }
        if fires(rng, c.hsv_p) {
            let hue = uniform(rng, (-c.hue_shift_deg, c.hue_shift_deg));
            let sat = uniform(rng, (-c.saturation_shift, c.saturation_shift));
            let val = uniform(rng, (-c.value_shift, c.value_shift));
            shift_hsv(&mut img, hue, sat, val);
        }
        if fires(rng, c.blur_p) {
            let direction = BLUR_DIRECTIONS[rng.gen_range(0..BLUR_DIRECTIONS.len())];
            img = motion_blur(&img, c.blur_kernel, direction);
        }
        if fires(rng, c.occlusion_p) {
            let fh = uniform(rng, c.occlusion_range);
            let fw = uniform(rng, c.occlusion_range);
            occlude(&mut img, fh, fw, rng);
        }
        img
    }
}

fn fires<R: Rng>(rng: &mut R, p: f64) -> bool {
    rng.gen::<f64>() < p
}

/// Uniform draw from `[lo, hi)`; a collapsed range returns `lo`.
fn uniform<R: Rng>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

fn flip_horizontal(img: &Array3<f32>) -> Array3<f32> {
    img.slice(s![.., ..;-1, ..]).to_owned()
}

/// Rotate about the image centre by `degrees` (counter-clockwise).
///
/// Bilinear sampling; pixels that map outside the source are black.
fn rotate(img: &Array3<f32>, degrees: f32) -> Array3<f32> {
    let (h, w, channels) = img.dim();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    let sample = |x: isize, y: isize, c: usize| -> f32 {
        if x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h {
            img[[y as usize, x as usize, c]]
        } else {
            0.0
        }
    };

    let mut out = Array3::<f32>::zeros((h, w, channels));
    for oy in 0..h {
        for ox in 0..w {
            // Inverse rotation maps the output pixel back into the source.
            let dx = ox as f32 - cx;
            let dy = oy as f32 - cy;
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;

            let x0 = sx.floor() as isize;
            let y0 = sy.floor() as isize;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            for c in 0..channels {
                let v = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                out[[oy, ox, c]] = clip_unit(v);
            }
        }
    }
    out
}

/// Shift hue (degrees), saturation and value of every pixel.
fn shift_hsv(img: &mut Array3<f32>, hue: f32, sat: f32, val: f32) {
    let (h, w, _) = img.dim();
    for y in 0..h {
        for x in 0..w {
            let rgb = [img[[y, x, 0]], img[[y, x, 1]], img[[y, x, 2]]];
            let (hh, ss, vv) = rgb_to_hsv(rgb);
            let shifted = hsv_to_rgb(
                (hh + hue).rem_euclid(360.0),
                clip_unit(ss + sat),
                clip_unit(vv + val),
            );
            for (c, v) in shifted.into_iter().enumerate() {
                img[[y, x, c]] = clip_unit(v);
            }
        }
    }
}

fn rgb_to_hsv([r, g, b]: [f32; 3]) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max <= f32::EPSILON { 0.0 } else { delta / max };
    (hue, saturation, max)
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [f32; 3] {
    let chroma = value * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = value - chroma;
    [r + m, g + m, b + m]
}

/// Average `kernel` taps along a line through each pixel, replicating edges.
fn motion_blur(img: &Array3<f32>, kernel: usize, (dy, dx): (isize, isize)) -> Array3<f32> {
    if kernel <= 1 {
        return img.clone();
    }
    let (h, w, channels) = img.dim();
    let half = (kernel / 2) as isize;
    let offsets: Vec<isize> = (0..kernel as isize).map(|i| i - half).collect();
    let weight = 1.0 / kernel as f32;

    let mut out = Array3::<f32>::zeros((h, w, channels));
    for y in 0..h {
        for x in 0..w {
            for c in 0..channels {
                let mut acc = 0.0;
                for &t in &offsets {
                    let sy = (y as isize + t * dy).clamp(0, h as isize - 1) as usize;
                    let sx = (x as isize + t * dx).clamp(0, w as isize - 1) as usize;
                    acc += img[[sy, sx, c]];
                }
                out[[y, x, c]] = clip_unit(acc * weight);
            }
        }
    }
    out
}

/// Black out a random rectangle covering `frac_h` of the height and `frac_w`
/// of the width.
fn occlude<R: Rng>(img: &mut Array3<f32>, frac_h: f32, frac_w: f32, rng: &mut R) {
    let (h, w, _) = img.dim();
    let ph = ((h as f32 * frac_h).round() as usize).clamp(1, h);
    let pw = ((w as f32 * frac_w).round() as usize).clamp(1, w);
    let y0 = rng.gen_range(0..=h - ph);
    let x0 = rng.gen_range(0..=w - pw);
    img.slice_mut(s![y0..y0 + ph, x0..x0 + pw, ..]).fill(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Zip;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn max_abs_diff(a: ArrayView3<'_, f32>, b: ArrayView3<'_, f32>) -> f32 {
        let mut max = 0.0f32;
        Zip::from(a).and(b).for_each(|&x, &y| max = max.max((x - y).abs()));
        max
    }

    fn gradient(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| ((x + 2 * y + c * 7) % 50) as f32 / 50.0)
    }

    fn disabled() -> AugmentationConfig {
        AugmentationConfig {
            flip_p: 0.0,
            brightness_p: 0.0,
            rotation_p: 0.0,
            noise_p: 0.0,
            contrast_p: 0.0,
            hsv_p: 0.0,
            blur_p: 0.0,
            occlusion_p: 0.0,
            ..AugmentationConfig::default()
        }
    }

    #[test]
    fn test_expand_count_and_base_first() {
        let face = gradient(40, 30);
        let expander = AugmentationExpander::new(32, AugmentationConfig::default());
        let out = expander.expand(face.view(), 5, &mut StdRng::seed_from_u64(7));

        assert_eq!(out.len(), 5);
        let base = fit_square(face.view(), 32).unwrap();
        assert_eq!(out[0].view(), base.view());
        for t in &out {
            assert_eq!(t.size(), 32);
            assert!(t.is_within_unit_range());
        }
    }

    #[test]
    fn test_expand_same_seed_reproduces() {
        let face = gradient(24, 24);
        let expander = AugmentationExpander::new(24, AugmentationConfig::default());
        let a = expander.expand(face.view(), 6, &mut StdRng::seed_from_u64(42));
        let b = expander.expand(face.view(), 6, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_expand_different_seeds_diverge() {
        let face = gradient(24, 24);
        let config = AugmentationConfig {
            noise_p: 1.0,
            ..AugmentationConfig::default()
        };
        let expander = AugmentationExpander::new(24, config);
        let a = expander.expand(face.view(), 3, &mut StdRng::seed_from_u64(1));
        let b = expander.expand(face.view(), 3, &mut StdRng::seed_from_u64(2));
        assert_eq!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn test_expand_zero_count_or_empty_input() {
        let expander = AugmentationExpander::new(16, AugmentationConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        assert!(expander.expand(gradient(16, 16).view(), 0, &mut rng).is_empty());
        assert!(expander.expand(Array3::<f32>::zeros((0, 16, 3)).view(), 4, &mut rng).is_empty());
    }

    #[test]
    fn test_disabled_transforms_copy_base() {
        let face = gradient(20, 20);
        let expander = AugmentationExpander::new(20, disabled());
        let out = expander.expand(face.view(), 3, &mut StdRng::seed_from_u64(3));
        assert_eq!(out[1], out[0]);
        assert_eq!(out[2], out[0]);
    }

    #[test]
    fn test_forced_flip_mirrors_base() {
        let face = gradient(20, 20);
        let config = AugmentationConfig {
            flip_p: 1.0,
            ..disabled()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let out = AugmentationExpander::new(20, config).expand(face.view(), 2, &mut rng);
        assert_eq!(out[1].view()[[3, 0, 1]], out[0].view()[[3, 19, 1]]);
        assert_eq!(out[1].view()[[7, 5, 2]], out[0].view()[[7, 14, 2]]);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let img = gradient(15, 15);
        assert!(max_abs_diff(rotate(&img, 0.0).view(), img.view()) < 1e-5);
    }

    #[test]
    fn test_rotate_keeps_shape_and_fills_black_corners() {
        let img = Array3::from_elem((21, 21, 3), 1.0f32);
        let out = rotate(&img, 15.0);
        assert_eq!(out.dim(), (21, 21, 3));
        assert!(out[[0, 0, 0]] < 0.5);
        assert!((out[[10, 10, 0]] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hsv_round_trip() {
        for rgb in [[0.2, 0.4, 0.9], [1.0, 0.0, 0.0], [0.5, 0.5, 0.5], [0.0, 0.7, 0.3]] {
            let (h, s, v) = rgb_to_hsv(rgb);
            let back = hsv_to_rgb(h, s, v);
            for c in 0..3 {
                assert!((back[c] - rgb[c]).abs() < 1e-5, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_hsv_zero_shift_is_identity() {
        let mut img = gradient(6, 6);
        let before = img.clone();
        shift_hsv(&mut img, 0.0, 0.0, 0.0);
        assert!(max_abs_diff(img.view(), before.view()) < 1e-5);
    }

    #[test]
    fn test_motion_blur_preserves_flat_image() {
        let img = Array3::from_elem((8, 8, 3), 0.3f32);
        for direction in BLUR_DIRECTIONS {
            let out = motion_blur(&img, 3, direction);
            assert!(max_abs_diff(out.view(), img.view()) < 1e-6);
        }
    }

    #[test]
    fn test_motion_blur_smears_along_line() {
        let mut img = Array3::<f32>::zeros((5, 5, 1));
        img[[2, 2, 0]] = 0.9;
        let out = motion_blur(&img, 3, (0, 1));
        assert!((out[[2, 1, 0]] - 0.3).abs() < 1e-6);
        assert!((out[[2, 3, 0]] - 0.3).abs() < 1e-6);
        assert_eq!(out[[1, 2, 0]], 0.0);
    }

    #[test]
    fn test_occlusion_patch_size() {
        let mut img = Array3::from_elem((100, 100, 3), 1.0f32);
        occlude(&mut img, 0.1, 0.05, &mut StdRng::seed_from_u64(5));
        let zeros = img.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(zeros, 10 * 5 * 3);
    }

    #[test]
    fn test_uniform_collapsed_range() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(uniform(&mut rng, (0.5, 0.5)), 0.5);
        let v = uniform(&mut rng, (0.7, 1.3));
        assert!((0.7..1.3).contains(&v));
    }
}
