//! Seams to the outside world: camera, detector, embedder and emotion model.
//!
//! Implementations live in `rollcall-hw` (camera) and `rollcall-models`
//! (ONNX inference). Every trait is `Send` so the whole set can move onto the
//! capture thread.

use crate::emotion::EmotionScores;
use crate::frame::Frame;
use crate::types::{Embedding, FaceRegion};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("frame acquisition failed: {0}")]
    Acquisition(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CapabilityError>;

    /// Free the device. Called once when the capture loop exits.
    fn release(&mut self) {}
}

pub trait FaceDetector: Send {
    /// All faces in the frame. An empty result is not an error.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, CapabilityError>;
}

pub trait FaceEmbedder: Send {
    fn embed(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, CapabilityError>;
}

pub trait EmotionModel: Send {
    fn predict(&mut self, frame: &Frame, region: &FaceRegion)
        -> Result<EmotionScores, CapabilityError>;
}
