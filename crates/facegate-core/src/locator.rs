//! Face location: pick the most prominent detection and crop it with padding.

use crate::config::DetectionConfig;
use crate::imaging;
use crate::types::BoundingBox;
use image::{GrayImage, RgbImage};

/// Source of candidate face rectangles in a grayscale image.
///
/// Candidates are returned in the detector's scan order; that order is what
/// breaks ties between equally large faces.
pub trait FaceDetect {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// A located face: the detector's rectangle, the padded crop rectangle and
/// the cropped RGB pixels.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub detection: BoundingBox,
    /// Rectangle actually cropped from the source image.
    pub bounds: BoundingBox,
    pub pixels: RgbImage,
}

pub struct FaceLocator<D> {
    detector: D,
    padding_x: f32,
    padding_y: f32,
    equalize: bool,
}

impl<D: FaceDetect> FaceLocator<D> {
    pub fn new(detector: D, config: &DetectionConfig) -> Self {
        Self {
            detector,
            padding_x: config.padding_x,
            padding_y: config.padding_y,
            equalize: config.equalize_histogram,
        }
    }

    /// Find the largest face in an RGB image.
    ///
    /// Returns `None` when the detector finds nothing or when both the padded
    /// and unpadded crops are empty.
    pub fn locate(&self, image: &RgbImage) -> Option<FaceRegion> {
        let (img_w, img_h) = image.dimensions();
        if img_w == 0 || img_h == 0 {
            return None;
        }

        let mut gray = imaging::to_grayscale(image);
        if self.equalize {
            imaging::equalize_hist(&mut gray);
        }

        let candidates = self.detector.detect(&gray);
        tracing::debug!(candidates = candidates.len(), "face candidates");

        let detection = select_largest(&candidates)?;
        let bounds = padded_bounds(&detection, img_w, img_h, self.padding_x, self.padding_y)?;
        let pixels =
            image::imageops::crop_imm(image, bounds.x, bounds.y, bounds.width, bounds.height)
                .to_image();

        Some(FaceRegion { detection, bounds, pixels })
    }
}

/// Largest candidate by area; on equal areas the earliest one wins.
pub fn select_largest(candidates: &[BoundingBox]) -> Option<BoundingBox> {
    let mut best: Option<BoundingBox> = None;
    for c in candidates {
        match best {
            Some(b) if c.area() <= b.area() => {}
            _ => best = Some(*c),
        }
    }
    best
}

/// Expand `face` by the padding fractions on each side, clamped to the image.
/// Falls back to the clamped unpadded rectangle when padding degenerates,
/// and to `None` when that is empty too.
fn padded_bounds(
    face: &BoundingBox,
    img_w: u32,
    img_h: u32,
    padding_x: f32,
    padding_y: f32,
) -> Option<BoundingBox> {
    let pad_w = (face.width as f32 * padding_x) as u32;
    let pad_h = (face.height as f32 * padding_y) as u32;

    let clamp = |x1: u32, y1: u32, x2: u32, y2: u32| -> Option<BoundingBox> {
        let (x1, y1) = (x1.min(img_w), y1.min(img_h));
        let (x2, y2) = (x2.min(img_w), y2.min(img_h));
        (x2 > x1 && y2 > y1).then(|| BoundingBox::new(x1, y1, x2 - x1, y2 - y1))
    };

    clamp(
        face.x.saturating_sub(pad_w),
        face.y.saturating_sub(pad_h),
        face.right().saturating_add(pad_w),
        face.bottom().saturating_add(pad_h),
    )
    .or_else(|| clamp(face.x, face.y, face.right(), face.bottom()))
}
