//! UltraFace (RFB-320) face detector via ONNX Runtime.
//!
//! The model takes a stretched 320x240 RGB image and emits, per prior box, a
//! `[background, face]` score pair and a corner-form box normalised to the
//! input. Decoding is a threshold followed by greedy NMS.

use crate::preprocess;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{CapabilityError, FaceRegion, Frame};
use std::path::Path;
use thiserror::Error;

const ULTRAFACE_WIDTH: u32 = 320;
const ULTRAFACE_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const DEFAULT_CONFIDENCE: f32 = 0.7;
const NMS_IOU: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for CapabilityError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => CapabilityError::ModelUnavailable(path),
            other => CapabilityError::Inference(other.to_string()),
        }
    }
}

pub struct UltraFaceDetector {
    session: Session,
    scores_idx: usize,
    boxes_idx: usize,
    confidence: f32,
}

impl UltraFaceDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let (scores_idx, boxes_idx) = output_indices(&output_names)?;

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            scores_idx,
            boxes_idx,
            "loaded UltraFace detector"
        );

        Ok(Self {
            session,
            scores_idx,
            boxes_idx,
            confidence: DEFAULT_CONFIDENCE,
        })
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Faces in `frame`, highest confidence first.
    pub fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError> {
        let resized = preprocess::resize_frame(frame, ULTRAFACE_WIDTH, ULTRAFACE_HEIGHT)
            .ok_or_else(|| {
                DetectorError::InferenceFailed(format!(
                    "frame buffer does not match {}x{}",
                    frame.width, frame.height
                ))
            })?;
        let input = preprocess::to_nchw(&resized, ULTRAFACE_MEAN, ULTRAFACE_STD, 3);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, scores) = outputs[self.scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[self.boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(scores, boxes, frame.width, frame.height, self.confidence)?;
        let faces = nms(candidates, NMS_IOU);
        tracing::trace!(count = faces.len(), seq = frame.sequence, "faces detected");
        Ok(faces)
    }
}

impl rollcall_core::FaceDetector for UltraFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, CapabilityError> {
        Ok(self.detect_faces(frame)?)
    }
}

/// Positions of the `scores` and `boxes` outputs, falling back to 0 and 1
/// for unnamed exports.
fn output_indices(names: &[String]) -> Result<(usize, usize), DetectorError> {
    if names.len() < 2 {
        return Err(DetectorError::InferenceFailed(format!(
            "UltraFace needs scores and boxes outputs, got {names:?}"
        )));
    }
    let position = |name: &str, fallback: usize| {
        names.iter().position(|n| n == name).unwrap_or(fallback)
    };
    let scores_idx = position("scores", 0);
    let boxes_idx = position("boxes", 1);
    if scores_idx == boxes_idx {
        return Err(DetectorError::InferenceFailed(format!(
            "cannot tell scores from boxes in outputs {names:?}"
        )));
    }
    Ok((scores_idx, boxes_idx))
}

/// Turn raw score/box tensors into frame-space regions above `threshold`.
fn decode(
    scores: &[f32],
    boxes: &[f32],
    frame_width: u32,
    frame_height: u32,
    threshold: f32,
) -> Result<Vec<FaceRegion>, DetectorError> {
    let priors = scores.len() / 2;
    if boxes.len() < priors * 4 {
        return Err(DetectorError::InferenceFailed(format!(
            "{priors} score pairs but only {} box values",
            boxes.len()
        )));
    }

    let (fw, fh) = (frame_width as f32, frame_height as f32);
    let regions = (0..priors)
        .filter_map(|i| {
            let confidence = scores[i * 2 + 1];
            if confidence < threshold {
                return None;
            }
            let b = &boxes[i * 4..i * 4 + 4];
            let left = (b[0] * fw).clamp(0.0, fw);
            let top = (b[1] * fh).clamp(0.0, fh);
            let right = (b[2] * fw).clamp(0.0, fw);
            let bottom = (b[3] * fh).clamp(0.0, fh);
            (right > left && bottom > top).then_some(FaceRegion {
                top,
                right,
                bottom,
                left,
                confidence,
            })
        })
        .collect();
    Ok(regions)
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<FaceRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        if kept.iter().all(|k| k.iou(&region) <= iou_threshold) {
            kept.push(region);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scales_and_filters() {
        let scores = [0.9, 0.1, 0.05, 0.95];
        let boxes = [0.0, 0.0, 0.1, 0.1, 0.25, 0.5, 0.75, 1.0];
        let regions = decode(&scores, &boxes, 640, 480, 0.7).unwrap();
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert_eq!((r.left, r.top, r.right, r.bottom), (160.0, 240.0, 480.0, 480.0));
        assert!((r.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_decode_clamps_and_drops_degenerate() {
        let scores = [0.0, 0.99, 0.0, 0.99];
        let boxes = [-0.1, -0.1, 0.5, 0.5, 0.6, 0.6, 0.6, 0.9];
        let regions = decode(&scores, &boxes, 100, 100, 0.5).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].left, regions[0].top), (0.0, 0.0));
    }

    #[test]
    fn test_decode_rejects_mismatched_tensors() {
        assert!(decode(&[0.1, 0.9, 0.1, 0.9], &[0.0; 4], 10, 10, 0.5).is_err());
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let regions = vec![
            FaceRegion::from_xywh(0.0, 0.0, 100.0, 100.0, 0.8),
            FaceRegion::from_xywh(5.0, 5.0, 100.0, 100.0, 0.9),
            FaceRegion::from_xywh(300.0, 300.0, 50.0, 50.0, 0.75),
        ];
        let kept = nms(regions, NMS_IOU);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_output_indices() {
        let names = |list: &[&str]| list.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert_eq!(output_indices(&names(&["scores", "boxes"])).unwrap(), (0, 1));
        assert_eq!(output_indices(&names(&["boxes", "scores"])).unwrap(), (1, 0));
        assert_eq!(output_indices(&names(&["out0", "out1"])).unwrap(), (0, 1));
        // Only "boxes" named, and it sits where scores would fall back to.
        assert!(output_indices(&names(&["boxes", "out1"])).is_err());
        assert!(output_indices(&names(&["scores"])).is_err());
    }

    #[test]
    fn test_missing_model() {
        let err = UltraFaceDetector::load("/nonexistent/ultraface.onnx").err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
        assert!(matches!(
            CapabilityError::from(err),
            CapabilityError::ModelUnavailable(_)
        ));
    }
}
