//! facegate-core — Face enrollment and verification engine.
//!
//! Locates faces with a Haar cascade, normalizes and augments them, embeds
//! them with an ONNX model and matches embeddings by cosine similarity
//! against a per-user store.

pub mod augment;
pub mod cascade;
pub mod config;
pub mod imaging;
pub mod locator;
pub mod normalizer;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;
pub mod verifier;

pub use config::PipelineConfig;
pub use pipeline::{
    FaceGateError, FacePipeline, PipelineStats, Registration, ResourcePaths, VerifyOutcome,
};
pub use types::{BoundingBox, CosineMatcher, Embedding, FaceTensor, MatchResult, Matcher};

use std::path::PathBuf;

/// Default location of the cascade and model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}
