//! Boundary operations: register, verify, user status, delete.
//!
//! Every request-level failure is a [`FaceGateError`] with a stable reason
//! code; nothing here panics or aborts on bad input.

use crate::augment::AugmentationExpander;
use crate::cascade::CascadeDetector;
use crate::config::{EnrollmentConfig, PipelineConfig};
use crate::imaging;
use crate::locator::{FaceDetect, FaceLocator};
use crate::normalizer::FaceNormalizer;
use crate::recognizer::{FaceEmbedder, OnnxEmbedder};
use crate::store::{EmbeddingStore, JsonFileBackend, StoreError};
use crate::types::FaceTensor;
use crate::verifier::Verifier;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceGateError {
    #[error("resource initialization failed: {0}")]
    ResourceInitialization(String),
    #[error("invalid user id {0:?}")]
    InvalidUserId(String),
    #[error("invalid image data: {0}")]
    InvalidImageData(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding extraction failed: {0}")]
    EmbeddingExtraction(String),
    #[error("user {0} is already registered")]
    UserAlreadyRegistered(String),
    #[error("user {0} is not registered")]
    UserNotRegistered(String),
    #[error("failed to persist embeddings: {0}")]
    StorePersistence(#[from] StoreError),
}

impl FaceGateError {
    /// Stable machine-readable code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ResourceInitialization(_) => "resource_initialization",
            Self::InvalidUserId(_) => "invalid_user_id",
            Self::InvalidImageData(_) => "invalid_image",
            Self::NoFaceDetected => "no_face_detected",
            Self::EmbeddingExtraction(_) => "embedding_failed",
            Self::UserAlreadyRegistered(_) => "user_already_registered",
            Self::UserNotRegistered(_) => "user_not_registered",
            Self::StorePersistence(_) => "store_persistence",
        }
    }

    /// Whether resubmitting (possibly with a new photo) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidImageData(_)
                | Self::NoFaceDetected
                | Self::EmbeddingExtraction(_)
                | Self::StorePersistence(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub embeddings_count: usize,
    /// Some augmented variants failed to embed and were left out.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyOutcome {
    pub verified: bool,
    pub score: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub users: usize,
    pub threshold: f32,
    pub input_size: usize,
    pub augmentations: usize,
}

/// File locations of the resources loaded at startup.
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    pub cascade: PathBuf,
    pub model: PathBuf,
    pub store: PathBuf,
}

pub struct FacePipeline<D, E> {
    locator: FaceLocator<D>,
    normalizer: FaceNormalizer,
    expander: AugmentationExpander,
    embedder: E,
    store: EmbeddingStore,
    verifier: Verifier,
    enrollment: EnrollmentConfig,
}

impl FacePipeline<CascadeDetector, OnnxEmbedder> {
    /// Load cascade, model and store. Any missing or corrupt resource fails
    /// here, before a single request is served.
    pub fn load(config: &PipelineConfig, paths: &ResourcePaths) -> Result<Self, FaceGateError> {
        config.validate().map_err(|e| init_error("config", e))?;
        let detector = CascadeDetector::load(&paths.cascade, config.detection.clone())
            .map_err(|e| init_error("cascade", e))?;
        let embedder = OnnxEmbedder::load(&paths.model, &config.model)
            .map_err(|e| init_error("embedding model", e))?;
        let store = EmbeddingStore::open(Box::new(JsonFileBackend::new(&paths.store)));

        Ok(Self::new(detector, embedder, store, config))
    }
}

impl<D: FaceDetect, E: FaceEmbedder> FacePipeline<D, E> {
    pub fn new(detector: D, embedder: E, store: EmbeddingStore, config: &PipelineConfig) -> Self {
        let size = embedder.input_size();
        Self {
            locator: FaceLocator::new(detector, &config.detection),
            normalizer: FaceNormalizer::new(size),
            expander: AugmentationExpander::new(size, config.augmentation.clone()),
            embedder,
            store,
            verifier: Verifier::new(config.verification_threshold),
            enrollment: config.enrollment.clone(),
        }
    }

    /// Enroll `user_id` from one photo, expanded into augmented variants.
    ///
    /// Uses a fresh random stream per call: seeded from the configured seed
    /// when there is one, otherwise from OS entropy.
    pub fn register(
        &mut self,
        user_id: &str,
        image_bytes: &[u8],
    ) -> Result<Registration, FaceGateError> {
        let mut rng = match self.enrollment.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.register_with_rng(user_id, image_bytes, &mut rng)
    }

    pub fn register_with_rng<R: Rng>(
        &mut self,
        user_id: &str,
        image_bytes: &[u8],
        rng: &mut R,
    ) -> Result<Registration, FaceGateError> {
        check_user_id(user_id)?;
        if self.store.exists(user_id) {
            return Err(FaceGateError::UserAlreadyRegistered(user_id.to_string()));
        }

        let face = self.normalized_face(image_bytes)?;
        let variants = self.expander.expand(face.view(), self.enrollment.augmentations, rng);
        let requested = variants.len();

        let mut results = self.embedder.embed(&variants).into_iter();
        let base = results
            .next()
            .ok_or_else(|| {
                FaceGateError::EmbeddingExtraction("no embedding for base image".into())
            })?
            .map_err(|e| FaceGateError::EmbeddingExtraction(e.to_string()))?;

        let mut embeddings = vec![base];
        let mut failed = 0usize;
        for (i, result) in results.enumerate() {
            match result {
                Ok(embedding) => embeddings.push(embedding),
                Err(e) => {
                    tracing::warn!(
                        user = user_id,
                        variant = i + 1,
                        error = %e,
                        "augmented variant failed to embed"
                    );
                    failed += 1;
                }
            }
        }
        failed += requested.saturating_sub(embeddings.len() + failed);

        if failed > 0 && !self.enrollment.allow_partial {
            return Err(FaceGateError::EmbeddingExtraction(format!(
                "{failed} of {requested} variants failed and partial registration is disabled"
            )));
        }

        let embeddings_count = embeddings.len();
        self.store.register(user_id, embeddings)?;

        tracing::info!(user = user_id, embeddings_count, degraded = failed > 0, "registered");
        Ok(Registration {
            embeddings_count,
            degraded: failed > 0,
        })
    }

    /// Compare one photo against the stored enrollment of `user_id`.
    pub fn verify(
        &mut self,
        user_id: &str,
        image_bytes: &[u8],
    ) -> Result<VerifyOutcome, FaceGateError> {
        check_user_id(user_id)?;
        if !self.store.exists(user_id) {
            return Err(FaceGateError::UserNotRegistered(user_id.to_string()));
        }

        let face = self.normalized_face(image_bytes)?;
        let query = self
            .embedder
            .embed_one(&face)
            .map_err(|e| FaceGateError::EmbeddingExtraction(e.to_string()))?;
        if let Some(enrolled) = self.store.get(user_id).first() {
            if enrolled.dim() != query.dim() {
                return Err(FaceGateError::EmbeddingExtraction(format!(
                    "model produced {} values but {user_id} was enrolled with {}",
                    query.dim(),
                    enrolled.dim()
                )));
            }
        }

        let decision = self.verifier.verify(&self.store, user_id, &query);
        tracing::info!(
            user = user_id,
            verified = decision.accepted,
            score = decision.score,
            "verified"
        );
        Ok(VerifyOutcome {
            verified: decision.accepted,
            score: decision.score,
            threshold: self.verifier.threshold(),
        })
    }

    pub fn user_status(&self, user_id: &str) -> bool {
        self.store.exists(user_id)
    }

    /// Remove `user_id`; `Ok(false)` when there was nothing to remove.
    pub fn delete(&mut self, user_id: &str) -> Result<bool, FaceGateError> {
        Ok(self.store.delete(user_id)?)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            users: self.store.len(),
            threshold: self.verifier.threshold(),
            input_size: self.normalizer.target_size(),
            augmentations: self.enrollment.augmentations,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Decode → locate → normalize.
    fn normalized_face(&self, image_bytes: &[u8]) -> Result<FaceTensor, FaceGateError> {
        let image = imaging::decode_rgb(image_bytes)
            .map_err(|e| FaceGateError::InvalidImageData(e.to_string()))?;
        let region = self.locator.locate(&image).ok_or(FaceGateError::NoFaceDetected)?;
        tracing::debug!(
            x = region.bounds.x,
            y = region.bounds.y,
            width = region.bounds.width,
            height = region.bounds.height,
            "face located"
        );
        self.normalizer
            .normalize(&region.pixels)
            .map_err(|e| FaceGateError::InvalidImageData(e.to_string()))
    }
}

fn init_error(what: &str, e: impl std::fmt::Display) -> FaceGateError {
    FaceGateError::ResourceInitialization(format!("{what}: {e}"))
}

fn check_user_id(user_id: &str) -> Result<(), FaceGateError> {
    if user_id.trim().is_empty() || user_id.chars().any(char::is_control) {
        return Err(FaceGateError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}
