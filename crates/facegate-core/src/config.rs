//! Pipeline tunables.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! verification_threshold = 0.7
//!
//! [enrollment]
//! augmentations = 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Cascade scan parameters and crop padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Window growth factor between scan scales (> 1).
    pub scale_factor: f32,
    /// A merged face needs more than this many raw hits; 0 keeps raw hits.
    pub min_neighbors: usize,
    /// Smallest window side scanned, in pixels.
    pub min_face_size: u32,
    pub max_face_size: Option<u32>,
    /// Horizontal padding added on each side, as a fraction of face width.
    pub padding_x: f32,
    /// Vertical padding added on each side, as a fraction of face height.
    pub padding_y: f32,
    pub equalize_histogram: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_face_size: 60,
            max_face_size: None,
            padding_x: 0.10,
            padding_y: 0.15,
            equalize_histogram: true,
        }
    }
}

/// Memory layout of the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `(1, S, S, 3)`: Keras/TensorFlow exports.
    Nhwc,
    /// `(1, 3, S, S)`: PyTorch exports.
    Nchw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Side of the square model input, in pixels.
    pub input_size: usize,
    pub embedding_dim: usize,
    pub layout: TensorLayout,
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: 160,
            embedding_dim: 128,
            layout: TensorLayout::Nhwc,
            intra_threads: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Images embedded per registration, including the unperturbed base.
    pub augmentations: usize,
    /// Keep a registration when some augmented variants fail to embed.
    pub allow_partial: bool,
    /// Fixed seed for the augmentation stream; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            augmentations: 5,
            allow_partial: true,
            seed: None,
        }
    }
}

/// Per-transform probabilities and ranges for enrollment augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub flip_p: f64,
    pub brightness_p: f64,
    pub brightness_range: (f32, f32),
    pub rotation_p: f64,
    pub max_rotation_deg: f32,
    pub noise_p: f64,
    pub noise_std_range: (f32, f32),
    pub contrast_p: f64,
    pub brightness_limit: f32,
    pub contrast_limit: f32,
    pub hsv_p: f64,
    pub hue_shift_deg: f32,
    pub saturation_shift: f32,
    pub value_shift: f32,
    pub blur_p: f64,
    pub blur_kernel: usize,
    pub occlusion_p: f64,
    /// Occluder side as a fraction of the image side.
    pub occlusion_range: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip_p: 0.5,
            brightness_p: 0.4,
            brightness_range: (0.7, 1.3),
            rotation_p: 0.4,
            max_rotation_deg: 15.0,
            noise_p: 0.3,
            noise_std_range: (0.01, 0.05),
            contrast_p: 0.4,
            brightness_limit: 0.15,
            contrast_limit: 0.15,
            hsv_p: 0.3,
            hue_shift_deg: 8.0,
            saturation_shift: 15.0 / 255.0,
            value_shift: 8.0 / 255.0,
            blur_p: 0.2,
            blur_kernel: 3,
            occlusion_p: 0.5,
            occlusion_range: (0.05, 0.15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub model: ModelConfig,
    pub enrollment: EnrollmentConfig,
    pub augmentation: AugmentationConfig,
    /// Minimum cosine similarity for a positive verification.
    pub verification_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            model: ModelConfig::default(),
            enrollment: EnrollmentConfig::default(),
            augmentation: AugmentationConfig::default(),
            verification_threshold: 0.65,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make the pipeline loop forever or produce
    /// empty tensors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.detection.scale_factor > 1.0) {
            return invalid(format!(
                "detection.scale_factor must be > 1, got {}",
                self.detection.scale_factor
            ));
        }
        if self.detection.padding_x < 0.0 || self.detection.padding_y < 0.0 {
            return invalid("detection padding must be non-negative".into());
        }
        if self.model.input_size == 0 || self.model.embedding_dim == 0 {
            return invalid("model.input_size and model.embedding_dim must be positive".into());
        }
        if self.enrollment.augmentations == 0 {
            return invalid("enrollment.augmentations must be at least 1".into());
        }
        if !(-1.0..=1.0).contains(&self.verification_threshold) {
            return invalid(format!(
                "verification_threshold must lie in [-1, 1], got {}",
                self.verification_threshold
            ));
        }

        let a = &self.augmentation;
        for (name, p) in [
            ("flip_p", a.flip_p),
            ("brightness_p", a.brightness_p),
            ("rotation_p", a.rotation_p),
            ("noise_p", a.noise_p),
            ("contrast_p", a.contrast_p),
            ("hsv_p", a.hsv_p),
            ("blur_p", a.blur_p),
            ("occlusion_p", a.occlusion_p),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("augmentation.{name} must lie in [0, 1], got {p}"));
            }
        }
        for (name, (lo, hi)) in [
            ("brightness_range", a.brightness_range),
            ("noise_std_range", a.noise_std_range),
            ("occlusion_range", a.occlusion_range),
        ] {
            if !(lo >= 0.0 && lo <= hi) {
                return invalid(format!(
                    "augmentation.{name} must satisfy 0 <= lo <= hi, got ({lo}, {hi})"
                ));
            }
        }
        if a.occlusion_range.1 > 1.0 {
            return invalid("augmentation.occlusion_range must not exceed 1".into());
        }
        if a.blur_kernel == 0 {
            return invalid("augmentation.blur_kernel must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.verification_threshold, 0.65);
        assert_eq!(config.model.input_size, 160);
        assert_eq!(config.enrollment.augmentations, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            verification_threshold = 0.7

            [enrollment]
            augmentations = 8
            seed = 42

            [model]
            layout = "nchw"
            "#,
        )
        .unwrap();
        assert_eq!(config.verification_threshold, 0.7);
        assert_eq!(config.enrollment.augmentations, 8);
        assert_eq!(config.enrollment.seed, Some(42));
        assert!(config.enrollment.allow_partial);
        assert_eq!(config.model.layout, TensorLayout::Nchw);
        assert_eq!(config.detection, DetectionConfig::default());
    }

    #[test]
    fn test_rejects_non_growing_scale() {
        let err = PipelineConfig::from_toml_str("[detection]\nscale_factor = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_augmentations() {
        let err = PipelineConfig::from_toml_str("[enrollment]\naugmentations = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_probability() {
        let err = PipelineConfig::from_toml_str("[augmentation]\nflip_p = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("flip_p"));
    }

    #[test]
    fn test_rejects_unparseable() {
        assert!(matches!(
            PipelineConfig::from_toml_str("verification_threshold = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
