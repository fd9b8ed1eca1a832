//! Embedding extraction stage.
//!
//! [`ArcFaceExtractor`] produces 512-dimensional embeddings from aligned
//! 112×112 face crops using the w600k_r50 ArcFace model.

use crate::alignment::ALIGNED_SIZE;
use crate::types::{l2_normalize, EmbeddingVector, FaceCrop};
use async_trait::async_trait;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: symmetric normalization
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("crop must be {expected}x{expected} aligned, got {width}x{height}")]
    NotAligned { expected: usize, width: u32, height: u32 },
    #[error("embedding timed out after {0} ms")]
    Timeout(u64),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an aligned, liveness-approved face crop to a fixed-length vector.
///
/// The extractor never re-detects or re-aligns.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    async fn embed(&self, aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError>;

    /// Length of every vector this extractor produces.
    fn dimension(&self) -> usize;
}

/// ArcFace-based embedding extractor.
pub struct ArcFaceExtractor {
    session: Arc<Mutex<Session>>,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbeddingError> {
        if !Path::new(model_path).exists() {
            return Err(EmbeddingError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Preprocess a 112x112 grayscale aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                // Grayscale → 3-channel
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }

        tensor
    }
}

#[async_trait]
impl EmbeddingExtractor for ArcFaceExtractor {
    async fn embed(&self, aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError> {
        if aligned.width as usize != ALIGNED_SIZE || aligned.height as usize != ALIGNED_SIZE {
            return Err(EmbeddingError::NotAligned {
                expected: ALIGNED_SIZE,
                width: aligned.width,
                height: aligned.height,
            });
        }

        let session = Arc::clone(&self.session);
        let input = Self::preprocess(&aligned.data);

        let raw = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, EmbeddingError> {
            let mut session = session
                .lock()
                .map_err(|_| EmbeddingError::InferenceFailed("recognizer session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, raw_data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbeddingError::InferenceFailed(format!("embedding extraction: {e}")))?;
            Ok(raw_data.to_vec())
        })
        .await
        .map_err(|e| EmbeddingError::InferenceFailed(format!("recognizer task: {e}")))??;

        finish_embedding(raw)
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

/// Check the raw model output and L2-normalize it.
fn finish_embedding(mut raw: Vec<f32>) -> Result<EmbeddingVector, EmbeddingError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(EmbeddingError::DimensionMismatch {
            expected: ARCFACE_EMBEDDING_DIM,
            actual: raw.len(),
        });
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::InferenceFailed("non-finite embedding value".into()));
    }

    l2_normalize(&mut raw);

    Ok(EmbeddingVector {
        values: raw,
        model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
    })
}
