//! Face embedding model via ONNX Runtime.
//!
//! The model is a black box with a fixed input contract: one float tensor of
//! a normalized RGB face, values in [0, 1], laid out NHWC or NCHW. Whatever
//! it outputs is L2-normalized here so every embedding leaving this module
//! has unit norm.

use crate::config::{ModelConfig, TensorLayout};
use crate::types::{Embedding, FaceTensor};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face tensor is {got}x{got}, model expects {expected}x{expected}")]
    InputShape { expected: usize, got: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced a degenerate embedding (zero or non-finite)")]
    Degenerate,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps normalized faces to unit-norm embeddings.
///
/// Failures are reported per face: one bad image does not void the others.
pub trait FaceEmbedder {
    /// Side length of the square input the model accepts.
    fn input_size(&self) -> usize;

    fn embed(&mut self, faces: &[FaceTensor]) -> Vec<Result<Embedding, RecognizerError>>;

    fn embed_one(&mut self, face: &FaceTensor) -> Result<Embedding, RecognizerError> {
        self.embed(std::slice::from_ref(face))
            .pop()
            .unwrap_or_else(|| {
                Err(RecognizerError::InferenceFailed(
                    "embedder returned no result".into(),
                ))
            })
    }
}

/// ONNX-backed embedder.
pub struct OnnxEmbedder {
    session: Session,
    input_size: usize,
    embedding_dim: usize,
    layout: TensorLayout,
}

impl OnnxEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &Path, config: &ModelConfig) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = config.input_size,
            embedding_dim = config.embedding_dim,
            layout = ?config.layout,
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size: config.input_size,
            embedding_dim: config.embedding_dim,
            layout: config.layout,
        })
    }

    fn embed_single(&mut self, face: &FaceTensor) -> Result<Embedding, RecognizerError> {
        let input = to_input_tensor(face, self.input_size, self.layout)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(raw_data.to_vec(), self.embedding_dim)
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn embed(&mut self, faces: &[FaceTensor]) -> Vec<Result<Embedding, RecognizerError>> {
        faces.iter().map(|face| self.embed_single(face)).collect()
    }
}

/// Lay a face out as a batch-of-one input tensor.
fn to_input_tensor(
    face: &FaceTensor,
    expected: usize,
    layout: TensorLayout,
) -> Result<Array4<f32>, RecognizerError> {
    if face.size() != expected {
        return Err(RecognizerError::InputShape {
            expected,
            got: face.size(),
        });
    }

    let view = face.view();
    let nhwc = view.insert_axis(ndarray::Axis(0));
    let tensor = match layout {
        TensorLayout::Nhwc => nhwc.to_owned(),
        TensorLayout::Nchw => nhwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned(),
    };
    Ok(tensor)
}

/// Check the output length and L2-normalize.
fn finish_embedding(raw: Vec<f32>, embedding_dim: usize) -> Result<Embedding, RecognizerError> {
    if raw.len() != embedding_dim {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {embedding_dim}-dim embedding, got {}",
            raw.len()
        )));
    }
    Embedding::from_raw(raw).ok_or(RecognizerError::Degenerate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn face(size: usize) -> FaceTensor {
        FaceTensor::from_array(Array3::from_shape_fn((size, size, 3), |(y, x, c)| {
            (y * 100 + x * 10 + c) as f32 / 1000.0
        }))
        .unwrap()
    }

    #[test]
    fn test_nhwc_input_tensor() {
        let t = to_input_tensor(&face(4), 4, TensorLayout::Nhwc).unwrap();
        assert_eq!(t.shape(), &[1, 4, 4, 3]);
        assert!((t[[0, 2, 1, 2]] - 0.212).abs() < 1e-6);
    }

    #[test]
    fn test_nchw_input_tensor() {
        let t = to_input_tensor(&face(4), 4, TensorLayout::Nchw).unwrap();
        assert_eq!(t.shape(), &[1, 3, 4, 4]);
        assert!(t.is_standard_layout());
        assert!((t[[0, 2, 2, 1]] - 0.212).abs() < 1e-6);
    }

    #[test]
    fn test_input_size_enforced() {
        let err = to_input_tensor(&face(4), 8, TensorLayout::Nhwc).unwrap_err();
        assert!(matches!(err, RecognizerError::InputShape { expected: 8, got: 4 }));
    }

    #[test]
    fn test_finish_embedding_normalizes() {
        let e = finish_embedding(vec![0.0, 3.0, 4.0], 3).unwrap();
        assert!(e.is_unit());
        assert!((e.values()[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_finish_embedding_rejects_wrong_dim() {
        assert!(matches!(
            finish_embedding(vec![1.0; 5], 128),
            Err(RecognizerError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_finish_embedding_rejects_zero_vector() {
        assert!(matches!(finish_embedding(vec![0.0; 4], 4), Err(RecognizerError::Degenerate)));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/model.onnx"), &ModelConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }

    struct Failing;

    impl FaceEmbedder for Failing {
        fn input_size(&self) -> usize {
            4
        }

        fn embed(&mut self, _faces: &[FaceTensor]) -> Vec<Result<Embedding, RecognizerError>> {
            Vec::new()
        }
    }

    #[test]
    fn test_embed_one_with_empty_result() {
        assert!(matches!(Failing.embed_one(&face(4)), Err(RecognizerError::InferenceFailed(_))));
    }
}
