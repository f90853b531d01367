//! Viola–Jones Haar cascade face detector.
//!
//! Evaluates a boosted cascade of Haar-feature stumps over a multi-scale
//! sliding window, using integral images for constant-time rectangle sums,
//! then merges overlapping hits into face rectangles.

use crate::config::DetectionConfig;
use crate::imaging::IntegralImage;
use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const GROUP_EPS: f32 = 0.2;
const BASE_STEP: f32 = 2.0;
const MAX_RECTS_PER_FEATURE: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// A weighted rectangle of a Haar feature, in base-window coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Depth-one decision tree over a single feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f32,
    /// Vote when the normalized feature value is below `threshold`.
    pub left: f32,
    /// Vote otherwise.
    pub right: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<Stump>,
}

/// A trained Haar cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    /// Base window width.
    pub width: u32,
    /// Base window height.
    pub height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_json(&text)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.width, cascade.height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse and validate a cascade from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, CascadeError> {
        let cascade: HaarCascade = serde_json::from_str(text)?;
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), CascadeError> {
        if self.width == 0 || self.height == 0 {
            return Err(CascadeError::Invalid("window size must be positive".into()));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }
        for (i, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() || feature.rects.len() > MAX_RECTS_PER_FEATURE {
                return Err(CascadeError::Invalid(format!(
                    "feature {i} has {} rectangles, expected 1..={MAX_RECTS_PER_FEATURE}",
                    feature.rects.len()
                )));
            }
            for r in &feature.rects {
                if r.width == 0
                    || r.height == 0
                    || r.x + r.width > self.width
                    || r.y + r.height > self.height
                {
                    return Err(CascadeError::Invalid(format!(
                        "feature {i} rectangle {r:?} outside the {}x{} window",
                        self.width, self.height
                    )));
                }
            }
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {s} has no classifiers")));
            }
            if let Some(bad) = stage.classifiers.iter().find(|c| c.feature >= self.features.len()) {
                return Err(CascadeError::Invalid(format!(
                    "stage {s} references feature {} of {}",
                    bad.feature,
                    self.features.len()
                )));
            }
        }
        Ok(())
    }

    /// Run every stage on the window at (`x`, `y`) scaled by `scale`.
    /// Returns true when all stages pass.
    fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32, scale: f32) -> bool {
        let (win_w, win_h) = self.window_at(scale);
        let area = win_w as f64 * win_h as f64;
        let sum = ii.rect_sum(x, y, win_w, win_h) as f64;
        let sq_sum = ii.rect_sq_sum(x, y, win_w, win_h) as f64;

        // sqrt(A·Q − S²) = A·σ; flat windows normalize by 1.
        let nf = area * sq_sum - sum * sum;
        let norm = if nf > 0.0 { nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut votes = 0.0f32;
            for stump in &stage.classifiers {
                let feature = &self.features[stump.feature];
                let value = self.feature_value(feature, ii, x, y, scale, win_w, win_h) / norm;
                votes += if (value as f32) < stump.threshold { stump.left } else { stump.right };
            }
            if votes < stage.threshold {
                return false;
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn feature_value(
        &self,
        feature: &HaarFeature,
        ii: &IntegralImage,
        x: u32,
        y: u32,
        scale: f32,
        win_w: u32,
        win_h: u32,
    ) -> f64 {
        feature
            .rects
            .iter()
            .map(|r| {
                let rx = scaled(r.x, scale).min(win_w - 1);
                let ry = scaled(r.y, scale).min(win_h - 1);
                let rw = scaled(r.width, scale).max(1).min(win_w - rx);
                let rh = scaled(r.height, scale).max(1).min(win_h - ry);
                r.weight as f64 * ii.rect_sum(x + rx, y + ry, rw, rh) as f64
            })
            .sum()
    }

    fn window_at(&self, scale: f32) -> (u32, u32) {
        (scaled(self.width, scale), scaled(self.height, scale))
    }

    /// Scan the image at every scale and return merged face rectangles,
    /// in first-found order.
    pub fn detect_multi_scale(
        &self,
        gray: &GrayImage,
        params: &DetectionConfig,
    ) -> Vec<BoundingBox> {
        let (img_w, img_h) = gray.dimensions();
        if img_w == 0 || img_h == 0 {
            return Vec::new();
        }

        let ii = IntegralImage::new(gray);
        let mut hits = Vec::new();
        let mut scale = 1.0f32;

        loop {
            let (win_w, win_h) = self.window_at(scale);
            if win_w > img_w || win_h > img_h {
                break;
            }
            if params.max_face_size.is_some_and(|m| win_w > m || win_h > m) {
                break;
            }

            if win_w >= params.min_face_size && win_h >= params.min_face_size {
                let step = ((BASE_STEP * scale).round() as usize).max(1);
                for y in (0..=img_h - win_h).step_by(step) {
                    for x in (0..=img_w - win_w).step_by(step) {
                        if self.evaluate(&ii, x, y, scale) {
                            hits.push(BoundingBox::new(x, y, win_w, win_h));
                        }
                    }
                }
            }

            if params.scale_factor <= 1.0 {
                break;
            }
            scale *= params.scale_factor;
        }

        let grouped = group_rectangles(&hits, params.min_neighbors, GROUP_EPS);
        tracing::debug!(raw = hits.len(), grouped = grouped.len(), "cascade scan finished");
        grouped
    }
}

fn scaled(v: u32, scale: f32) -> u32 {
    (v as f32 * scale).round() as u32
}

/// Cascade classifier bundled with its scan parameters.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectionConfig,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectionConfig) -> Self {
        Self { cascade, params }
    }

    /// Load the cascade resource from `path`.
    pub fn load(path: &Path, params: DetectionConfig) -> Result<Self, CascadeError> {
        Ok(Self::new(HaarCascade::load(path)?, params))
    }
}

impl crate::locator::FaceDetect for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        self.cascade.detect_multi_scale(gray, &self.params)
    }
}

/// Whether two rectangles are close enough to describe the same face.
fn similar_rects(a: &BoundingBox, b: &BoundingBox, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.right(), b.right())
        && close(a.bottom(), b.bottom())
}

/// Assign equivalence-class labels via union-find over `similar_rects`.
///
/// Labels are numbered in order of each class's first member, so the
/// returned classes follow scan order.
fn partition(rects: &[BoundingBox], eps: f32) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in 0..i {
            if similar_rects(&rects[i], &rects[j], eps) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut label_of_root = vec![usize::MAX; n];
    let mut labels = vec![0; n];
    let mut count = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if label_of_root[root] == usize::MAX {
            label_of_root[root] = count;
            count += 1;
        }
        labels[i] = label_of_root[root];
    }
    (labels, count)
}

/// Merge raw detections: average each cluster of similar rectangles, drop
/// clusters with `group_threshold` or fewer members, and drop weak clusters
/// nested inside stronger ones. `group_threshold == 0` returns the raw hits.
fn group_rectangles(rects: &[BoundingBox], group_threshold: usize, eps: f32) -> Vec<BoundingBox> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, nclasses) = partition(rects, eps);

    let mut sums = vec![[0u64; 4]; nclasses];
    let mut weights = vec![0usize; nclasses];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x as u64;
        s[1] += r.y as u64;
        s[2] += r.right() as u64;
        s[3] += r.bottom() as u64;
        weights[label] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&weights)
        .map(|(s, &n)| {
            // Edges, not sizes, are averaged so merged boxes stay inside the image.
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            let (x, y) = (avg(s[0]), avg(s[1]));
            BoundingBox::new(x, y, avg(s[2]).saturating_sub(x), avg(s[3]).saturating_sub(y))
        })
        .collect();

    let mut out = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = weights[i];
        if n1 <= group_threshold {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = weights[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (r2.width as f32 * eps).round() as i64;
            let dy = (r2.height as f32 * eps).round() as i64;
            let (x1, y1, x2, y2) = (r1.x as i64, r1.y as i64, r2.x as i64, r2.y as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && r1.right() as i64 <= r2.right() as i64 + dx
                && r1.bottom() as i64 <= r2.bottom() as i64 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            out.push(*r1);
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// One-stage cascade over a 20x20 window that fires on a dark-left /
    /// bright-right vertical edge.
    pub(crate) const EDGE_CASCADE: &str = r#"{
        "width": 20,
        "height": 20,
        "stages": [
            { "threshold": 0.0,
              "classifiers": [ { "feature": 0, "threshold": 0.5, "left": -1.0, "right": 1.0 } ] }
        ],
        "features": [
            { "rects": [
                { "x": 0,  "y": 0, "width": 10, "height": 20, "weight": -1.0 },
                { "x": 10, "y": 0, "width": 10, "height": 20, "weight": 1.0 }
            ] }
        ]
    }"#;

    fn params(min_neighbors: usize) -> DetectionConfig {
        DetectionConfig {
            scale_factor: 1.1,
            min_neighbors,
            min_face_size: 20,
            ..DetectionConfig::default()
        }
    }

    fn edge_image(w: u32, h: u32, edge_x: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if x < edge_x { 0 } else { 255 }]))
    }

    #[test]
    fn test_parse_edge_cascade() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        assert_eq!((c.width, c.height), (20, 20));
        assert_eq!(c.stages.len(), 1);
        assert_eq!(c.features[0].rects.len(), 2);
    }

    #[test]
    fn test_rejects_dangling_feature_index() {
        let text = EDGE_CASCADE.replace(r#""feature": 0"#, r#""feature": 3"#);
        assert!(matches!(HaarCascade::from_json(&text), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_rejects_rect_outside_window() {
        let text = EDGE_CASCADE.replace(r#""x": 10,"#, r#""x": 15,"#);
        assert!(matches!(HaarCascade::from_json(&text), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(HaarCascade::from_json("{ not json"), Err(CascadeError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = HaarCascade::load(Path::new("/nonexistent/cascade.json")).unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn test_evaluate_on_centered_edge() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let ii = IntegralImage::new(&edge_image(20, 20, 10));
        assert!(c.evaluate(&ii, 0, 0, 1.0));
    }

    #[test]
    fn test_evaluate_rejects_flat_and_inverted() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let flat = IntegralImage::new(&GrayImage::from_pixel(20, 20, Luma([128])));
        assert!(!c.evaluate(&flat, 0, 0, 1.0));

        let inverted = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 255 } else { 0 }]));
        assert!(!c.evaluate(&IntegralImage::new(&inverted), 0, 0, 1.0));
    }

    #[test]
    fn test_detect_multi_scale_finds_edge() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let found = c.detect_multi_scale(&edge_image(40, 40, 20), &params(3));
        assert!(!found.is_empty());
        for b in &found {
            assert!(!b.is_empty());
            assert!(b.fits_within(40, 40), "{b:?} outside image");
        }
    }

    #[test]
    fn test_detect_multi_scale_flat_image() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let found = c.detect_multi_scale(&GrayImage::from_pixel(60, 60, Luma([90])), &params(0));
        assert!(found.is_empty());
    }

    #[test]
    fn test_min_face_size_skips_small_windows() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let mut p = params(0);
        p.min_face_size = 100;
        assert!(c.detect_multi_scale(&edge_image(40, 40, 20), &p).is_empty());
    }

    #[test]
    fn test_image_smaller_than_window() {
        let c = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        assert!(c.detect_multi_scale(&edge_image(10, 10, 5), &params(0)).is_empty());
    }

    #[test]
    fn test_group_zero_threshold_returns_raw() {
        let rects = vec![BoundingBox::new(0, 0, 10, 10), BoundingBox::new(1, 1, 10, 10)];
        assert_eq!(group_rectangles(&rects, 0, GROUP_EPS), rects);
    }

    #[test]
    fn test_group_merges_cluster() {
        let rects = vec![
            BoundingBox::new(100, 100, 50, 50),
            BoundingBox::new(102, 100, 50, 50),
            BoundingBox::new(100, 102, 50, 50),
            BoundingBox::new(102, 102, 50, 50),
        ];
        let grouped = group_rectangles(&rects, 2, GROUP_EPS);
        assert_eq!(grouped, vec![BoundingBox::new(101, 101, 50, 50)]);
    }

    #[test]
    fn test_group_drops_weak_clusters() {
        let rects = vec![
            BoundingBox::new(0, 0, 20, 20),
            BoundingBox::new(1, 0, 20, 20),
            BoundingBox::new(200, 200, 20, 20),
        ];
        let grouped = group_rectangles(&rects, 1, GROUP_EPS);
        assert_eq!(grouped, vec![BoundingBox::new(1, 0, 20, 20)]);
    }

    #[test]
    fn test_group_preserves_first_found_order() {
        let rects = vec![
            BoundingBox::new(300, 0, 40, 40),
            BoundingBox::new(0, 0, 40, 40),
            BoundingBox::new(300, 1, 40, 40),
            BoundingBox::new(0, 1, 40, 40),
        ];
        let grouped = group_rectangles(&rects, 1, GROUP_EPS);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].x, 300);
        assert_eq!(grouped[1].x, 0);
    }

    #[test]
    fn test_group_drops_nested_small_cluster() {
        let mut rects = Vec::new();
        for _ in 0..6 {
            rects.push(BoundingBox::new(0, 0, 100, 100));
        }
        for _ in 0..2 {
            rects.push(BoundingBox::new(30, 30, 20, 20));
        }
        let grouped = group_rectangles(&rects, 1, GROUP_EPS);
        assert_eq!(grouped, vec![BoundingBox::new(0, 0, 100, 100)]);
    }
}
