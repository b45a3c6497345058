//! Facial emotion classifiers via ONNX Runtime.
//!
//! Two network layouts are understood: FER+ (8 classes, 64x64, raw pixel
//! values) as the primary model and a FER-2013 style 7-class network (48x48,
//! pixels scaled to 0..1) as the fallback. Both are mapped onto the fixed
//! [`Emotion`] label set.

use crate::preprocess;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{CapabilityError, Emotion, EmotionModel, EmotionScores, FaceRegion, Frame};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmotionModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face region lies outside the frame")]
    EmptyRegion,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<EmotionModelError> for CapabilityError {
    fn from(e: EmotionModelError) -> Self {
        match e {
            EmotionModelError::ModelNotFound(path) => CapabilityError::ModelUnavailable(path),
            other => CapabilityError::Inference(other.to_string()),
        }
    }
}

/// Input geometry and class order of a supported network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmotionLayout {
    /// emotion-ferplus-8: neutral, happiness, surprise, sadness, anger,
    /// disgust, fear, contempt.
    FerPlus,
    /// FER-2013: angry, disgust, fear, happy, sad, surprise, neutral.
    Fer2013,
}

impl EmotionLayout {
    fn input_size(self) -> u32 {
        match self {
            EmotionLayout::FerPlus => 64,
            EmotionLayout::Fer2013 => 48,
        }
    }

    /// (mean, std) applied to raw pixel values.
    fn normalization(self) -> (f32, f32) {
        match self {
            EmotionLayout::FerPlus => (0.0, 1.0),
            EmotionLayout::Fer2013 => (0.0, 255.0),
        }
    }

    /// Output position to label. Contempt folds into disgust.
    fn classes(self) -> &'static [Emotion] {
        match self {
            EmotionLayout::FerPlus => &[
                Emotion::Neutral,
                Emotion::Happy,
                Emotion::Surprise,
                Emotion::Sad,
                Emotion::Angry,
                Emotion::Disgust,
                Emotion::Fear,
                Emotion::Disgust,
            ],
            EmotionLayout::Fer2013 => &[
                Emotion::Angry,
                Emotion::Disgust,
                Emotion::Fear,
                Emotion::Happy,
                Emotion::Sad,
                Emotion::Surprise,
                Emotion::Neutral,
            ],
        }
    }

    /// Softmax the logits and accumulate them onto the fixed label set.
    pub fn scores_from_logits(self, logits: &[f32]) -> Result<EmotionScores, EmotionModelError> {
        let classes = self.classes();
        if logits.len() != classes.len() {
            return Err(EmotionModelError::InferenceFailed(format!(
                "{self:?} expects {} outputs, got {}",
                classes.len(),
                logits.len()
            )));
        }
        let mut scores = [0.0f32; 7];
        for (p, emotion) in preprocess::softmax(logits).into_iter().zip(classes) {
            let slot = Emotion::ALL
                .iter()
                .position(|e| e == emotion)
                .unwrap_or_default();
            scores[slot] += p;
        }
        Ok(EmotionScores(scores))
    }
}

pub struct EmotionNet {
    session: Session,
    layout: EmotionLayout,
}

impl EmotionNet {
    pub fn load(model_path: &str, layout: EmotionLayout) -> Result<Self, EmotionModelError> {
        if !Path::new(model_path).exists() {
            return Err(EmotionModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, layout = ?layout, "loaded emotion model");
        Ok(Self { session, layout })
    }

    pub fn layout(&self) -> EmotionLayout {
        self.layout
    }

    pub fn classify(
        &mut self,
        frame: &Frame,
        region: &FaceRegion,
    ) -> Result<EmotionScores, EmotionModelError> {
        let patch = preprocess::face_patch(frame, region, self.layout.input_size())
            .ok_or(EmotionModelError::EmptyRegion)?;
        let (mean, std) = self.layout.normalization();
        let input = preprocess::to_nchw(&patch, mean, std, 1);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmotionModelError::InferenceFailed(format!("logits: {e}")))?;

        self.layout.scores_from_logits(logits)
    }
}

impl EmotionModel for EmotionNet {
    fn predict(&mut self, frame: &Frame, region: &FaceRegion) -> Result<EmotionScores, CapabilityError> {
        Ok(self.classify(frame, region)?)
    }
}
