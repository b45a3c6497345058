//! Single-face enrollment: detect, quality-gate, embed, register.

use crate::capability::{FaceDetector, FaceEmbedder};
use crate::frame::Frame;
use crate::gallery::{validate_label, GalleryError};
use crate::matcher::IdentityMatcher;
use crate::quality::FaceQuality;
use crate::types::FaceRegion;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationFailure {
    #[error("invalid label: {0}")]
    InvalidLabel(String),
    #[error("no face found")]
    NoFace,
    #[error("{0} faces found, expected exactly one")]
    MultipleFaces(usize),
    #[error("face quality too low ({0:.2})")]
    LowQuality(f32),
    #[error("{0}")]
    Capability(String),
    /// The entry is in memory but could not be written to disk.
    #[error("gallery not persisted: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enrolled {
    pub label: String,
    pub id: Uuid,
    pub region: FaceRegion,
    pub quality: FaceQuality,
}

/// Enroll the single face visible in `frame` under `label`.
pub fn enroll_from_frame(
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    matcher: &mut IdentityMatcher,
    frame: &Frame,
    label: &str,
) -> Result<Enrolled, RegistrationFailure> {
    let label = validate_label(label)
        .map_err(|e| RegistrationFailure::InvalidLabel(e.to_string()))?
        .to_string();

    let regions = detector
        .detect(frame)
        .map_err(|e| RegistrationFailure::Capability(e.to_string()))?;
    let region = match regions.as_slice() {
        [] => return Err(RegistrationFailure::NoFace),
        [region] => *region,
        many => return Err(RegistrationFailure::MultipleFaces(many.len())),
    };

    let quality = FaceQuality::assess(frame, &region);
    if !quality.is_acceptable() {
        tracing::debug!(
            label = %label,
            overall = quality.overall,
            brightness = quality.mean_brightness,
            sharpness = quality.laplacian_variance,
            "face rejected by quality gate"
        );
        return Err(RegistrationFailure::LowQuality(quality.overall));
    }

    let embedding = embedder
        .embed(frame, &region)
        .map_err(|e| RegistrationFailure::Capability(e.to_string()))?;

    let id = matcher.register(&label, embedding).map_err(|e| match e {
        GalleryError::InvalidInput(reason) => RegistrationFailure::InvalidLabel(reason),
        other => RegistrationFailure::Storage(other.to_string()),
    })?;

    tracing::info!(label = %label, id = %id, quality = quality.overall, "face registered");
    Ok(Enrolled {
        label,
        id,
        region,
        quality,
    })
}
