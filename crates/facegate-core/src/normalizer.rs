//! Face normalization: RGB crop → square float tensor of the model's input size.
//!
//! Geometry follows "shortest side to target, pad, center-crop": resize with
//! area interpolation so the shorter side equals the target, zero-pad
//! symmetrically up to a square if rounding left it short, then center-crop
//! the longer side.

use crate::types::{clip_unit, FaceTensor};
use image::RgbImage;
use ndarray::{s, Array3, ArrayView3};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("face crop is empty ({width}x{height})")]
    EmptyCrop { width: u32, height: u32 },
}

pub struct FaceNormalizer {
    target_size: usize,
}

impl FaceNormalizer {
    pub fn new(target_size: usize) -> Self {
        Self { target_size }
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Normalize an 8-bit RGB face crop to `(target, target, 3)` floats in [0, 1].
    pub fn normalize(&self, face: &RgbImage) -> Result<FaceTensor, NormalizeError> {
        let (width, height) = face.dimensions();
        let empty = NormalizeError::EmptyCrop { width, height };
        if width == 0 || height == 0 || self.target_size == 0 {
            return Err(empty);
        }

        let unit = rgb_to_unit(face);
        fit_square(unit.view(), self.target_size)
            .and_then(FaceTensor::from_array)
            .ok_or(empty)
    }
}

/// Convert 8-bit RGB to an `(H, W, 3)` float array scaled to [0, 1].
pub fn rgb_to_unit(face: &RgbImage) -> Array3<f32> {
    let (w, h) = face.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        face.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// Bring an `(H, W, 3)` image to `(size, size, 3)`: area-resize so the shorter
/// side equals `size`, pad symmetrically with black, then center-crop.
///
/// Returns `None` for an empty image.
pub fn fit_square(image: ArrayView3<'_, f32>, size: usize) -> Option<Array3<f32>> {
    let (h, w, channels) = image.dim();
    if h == 0 || w == 0 || size == 0 {
        return None;
    }

    let (new_h, new_w) = if h <= w {
        (size, ((w as f64 * size as f64 / h as f64).round() as usize).max(1))
    } else {
        (((h as f64 * size as f64 / w as f64).round() as usize).max(1), size)
    };
    let resized = if (new_h, new_w) == (h, w) {
        image.to_owned()
    } else {
        resize_area(image, new_h, new_w)
    };

    // Pad up to at least size x size.
    let padded_h = new_h.max(size);
    let padded_w = new_w.max(size);
    let top = (padded_h - new_h) / 2;
    let left = (padded_w - new_w) / 2;
    let mut padded = Array3::<f32>::zeros((padded_h, padded_w, channels));
    padded
        .slice_mut(s![top..top + new_h, left..left + new_w, ..])
        .assign(&resized);

    // Center-crop down to exactly size x size.
    let y0 = (padded_h - size) / 2;
    let x0 = (padded_w - size) / 2;
    let mut out = padded.slice(s![y0..y0 + size, x0..x0 + size, ..]).to_owned();
    out.mapv_inplace(clip_unit);
    Some(out)
}

/// Per-output-index list of (input index, weight) covering one output cell.
/// Weights for each output cell sum to 1.
fn area_weights(in_len: usize, out_len: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|o| {
            let start = o as f64 * scale;
            let end = start + scale;
            let mut weights = Vec::new();
            let mut i = start.floor() as usize;
            while (i as f64) < end && i < in_len {
                let cover = end.min(i as f64 + 1.0) - start.max(i as f64);
                if cover > 1e-9 {
                    weights.push((i, (cover / scale) as f32));
                }
                i += 1;
            }
            weights
        })
        .collect()
}

/// Area-interpolated resize: each output pixel is the coverage-weighted mean
/// of the input pixels under it.
pub(crate) fn resize_area(image: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (in_h, in_w, channels) = image.dim();
    let wx = area_weights(in_w, out_w);
    let wy = area_weights(in_h, out_h);

    // Horizontal pass.
    let mut horizontal = Array3::<f32>::zeros((in_h, out_w, channels));
    for y in 0..in_h {
        for (ox, taps) in wx.iter().enumerate() {
            for c in 0..channels {
                horizontal[[y, ox, c]] = taps.iter().map(|&(ix, wt)| image[[y, ix, c]] * wt).sum();
            }
        }
    }

    // Vertical pass.
    let mut out = Array3::<f32>::zeros((out_h, out_w, channels));
    for (oy, taps) in wy.iter().enumerate() {
        for x in 0..out_w {
            for c in 0..channels {
                out[[oy, x, c]] = taps.iter().map(|&(iy, wt)| horizontal[[iy, x, c]] * wt).sum();
            }
        }
    }
    out
}
