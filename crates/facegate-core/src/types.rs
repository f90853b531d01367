use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in pixel coordinates of some source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Whether the rectangle lies entirely inside a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }
}

/// Fixed-length face embedding with unit L2 norm.
///
/// Serialized as a bare list of floats so the store file stays a plain
/// `user_id -> [[f32]]` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Allowed deviation of ‖v‖₂ from 1.
    pub const NORM_TOLERANCE: f32 = 1e-3;

    /// L2-normalize a raw model output.
    ///
    /// Returns `None` for empty, zero-norm or non-finite vectors, which
    /// cannot be turned into a direction.
    pub fn from_raw(raw: Vec<f32>) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        // f64 keeps x² finite and non-zero across the whole f32 range.
        let norm = raw.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
        if norm == 0.0 {
            return None;
        }
        let embedding = Self {
            values: raw.into_iter().map(|x| (f64::from(x) / norm) as f32).collect(),
        };
        embedding.is_unit().then_some(embedding)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt() as f32
    }

    /// True when the vector is finite and its norm is within
    /// [`NORM_TOLERANCE`](Self::NORM_TOLERANCE) of 1.
    pub fn is_unit(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
            && (self.norm() - 1.0).abs() <= Self::NORM_TOLERANCE
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// A normalized face image: `(size, size, 3)` RGB, float values in [0, 1].
///
/// This is the only input shape the embedding model accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTensor {
    data: Array3<f32>,
}

impl FaceTensor {
    /// Wrap an `(H, W, 3)` array. Returns `None` unless the array is a
    /// non-empty square with three channels. Values are clipped to [0, 1].
    pub fn from_array(mut data: Array3<f32>) -> Option<Self> {
        let (h, w, c) = data.dim();
        if h == 0 || h != w || c != 3 {
            return None;
        }
        data.mapv_inplace(clip_unit);
        Some(Self { data })
    }

    /// Side length in pixels.
    pub fn size(&self) -> usize {
        self.data.dim().0
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }

    pub fn is_within_unit_range(&self) -> bool {
        self.data.iter().all(|v| (0.0..=1.0).contains(v))
    }
}

/// Clip a float pixel to [0, 1]; NaN becomes 0.
pub(crate) fn clip_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best match [-1, 1], or 0.0 for an empty gallery.
    pub similarity: f32,
    /// Index of the best-scoring gallery entry (if any).
    pub best_index: Option<usize>,
}

/// Strategy for comparing a probe embedding against the embeddings of one identity.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Embedding], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher: score is the maximum similarity over the
/// whole gallery.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Embedding], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, reference) in gallery.iter().enumerate() {
            if reference.dim() != probe.dim() {
                tracing::warn!(
                    index = i,
                    stored = reference.dim(),
                    probe = probe.dim(),
                    "skipping stored embedding with mismatched dimension"
                );
                continue;
            }
            let sim = probe.similarity(reference);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) => MatchResult {
                matched: best_sim >= threshold,
                similarity: best_sim,
                best_index: Some(idx),
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                best_index: None,
            },
        }
    }
}
