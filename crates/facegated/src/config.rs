use facegate_core::config::ConfigError;
use facegate_core::{PipelineConfig, ResourcePaths};
use std::path::{Path, PathBuf};

/// Cascade file name looked up in the model directory.
const CASCADE_FILE: &str = "haarcascade_frontalface.json";
/// Embedding model file name looked up in the model directory.
const MODEL_FILE: &str = "face_embedder.onnx";
const STORE_FILE: &str = "embeddings.json";

/// Daemon configuration: pipeline tunables plus resource locations.
pub struct Config {
    pub pipeline: PipelineConfig,
    pub paths: ResourcePaths,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    ///
    /// `FACEGATE_CONFIG` names an optional TOML file; individual variables
    /// override what it sets.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut pipeline = match var("FACEGATE_CONFIG") {
            Some(path) => PipelineConfig::from_toml_file(Path::new(&path))?,
            None => PipelineConfig::default(),
        };
        let enrollment = &mut pipeline.enrollment;
        enrollment.augmentations =
            parse_or(&var, "FACEGATE_AUGMENTATIONS", enrollment.augmentations);
        pipeline.verification_threshold =
            parse_or(&var, "FACEGATE_THRESHOLD", pipeline.verification_threshold);
        pipeline.validate()?;

        let model_dir = var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facegate_core::default_model_dir);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let paths = ResourcePaths {
            cascade: var("FACEGATE_CASCADE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.join(CASCADE_FILE)),
            model: var("FACEGATE_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.join(MODEL_FILE)),
            store: var("FACEGATE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(STORE_FILE)),
        };

        Ok(Self {
            pipeline,
            paths,
            session_bus: var("FACEGATE_SESSION_BUS").is_some_and(|v| v == "1"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
