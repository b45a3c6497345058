//! ArcFace embedder via ONNX Runtime.
//!
//! Produces L2-normalised 512-dimensional embeddings from a 112x112 crop of
//! the detected face box.

use crate::preprocess;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{CapabilityError, Embedding, FaceRegion, Frame};
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face region lies outside the frame")]
    EmptyRegion,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<EmbedderError> for CapabilityError {
    fn from(e: EmbedderError) -> Self {
        match e {
            EmbedderError::ModelNotFound(path) => CapabilityError::ModelUnavailable(path),
            other => CapabilityError::Inference(other.to_string()),
        }
    }
}

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace embedder"
        );

        Ok(Self { session })
    }

    pub fn extract(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, EmbedderError> {
        let patch = preprocess::face_patch(frame, region, ARCFACE_INPUT_SIZE)
            .ok_or(EmbedderError::EmptyRegion)?;
        let input = preprocess::to_nchw(&patch, ARCFACE_MEAN, ARCFACE_STD, 3);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: preprocess::l2_normalize(raw.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

impl rollcall_core::FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, CapabilityError> {
        Ok(self.extract(frame, region)?)
    }
}
