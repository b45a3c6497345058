//! Still images: enrollment from a file or a folder of per-person
//! sub-folders, and recognition of the faces in a single image.

use anyhow::{Context, Result};
use rollcall_core::enroll::{enroll_from_frame, Enrolled, RegistrationFailure};
use rollcall_core::{FaceDetector, FaceEmbedder, FaceRegion, Frame, IdentityMatcher, MatchResult};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];
const ANNOTATION_INTENSITY: u8 = 255;
const ANNOTATION_THICKNESS: usize = 2;

/// Outcome of a folder import.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FolderStats {
    pub total_images: usize,
    pub successful: usize,
    pub failed: usize,
    pub persons_registered: usize,
}

/// Decode an image file into a grayscale frame.
pub fn load_frame(path: &Path) -> Result<Frame> {
    let gray = image::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .to_luma8();
    let (width, height) = gray.dimensions();
    Ok(Frame::new(gray.into_raw(), width, height, 0))
}

pub fn enroll_image(
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    matcher: &mut IdentityMatcher,
    path: &Path,
    label: &str,
) -> Result<Enrolled, RegistrationFailure> {
    let frame = load_frame(path).map_err(|e| RegistrationFailure::Capability(format!("{e:#}")))?;
    enroll_from_frame(detector, embedder, matcher, &frame, label)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// `(person, images)` pairs for every sub-folder of `root`, sorted by name.
pub fn scan_folder(root: &Path) -> Result<Vec<(String, Vec<PathBuf>)>> {
    let mut people = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let mut images: Vec<PathBuf> = std::fs::read_dir(entry.path())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        images.sort();
        people.push((name, images));
    }
    people.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(people)
}

/// Enroll every image under `root/<person>/`.
pub fn enroll_folder(
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    matcher: &mut IdentityMatcher,
    root: &Path,
) -> Result<FolderStats> {
    let mut stats = FolderStats::default();

    for (person, images) in scan_folder(root)? {
        if images.is_empty() {
            tracing::warn!(person = %person, "no images found");
            continue;
        }
        let mut registered = 0usize;
        for path in &images {
            stats.total_images += 1;
            match enroll_image(detector, embedder, matcher, path, &person) {
                Ok(_) => {
                    registered += 1;
                    stats.successful += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(person = %person, image = %path.display(), reason = %e, "image skipped");
                }
            }
        }
        if registered > 0 {
            stats.persons_registered += 1;
        }
        tracing::info!(person = %person, registered, images = images.len(), "person processed");
    }
    Ok(stats)
}

/// One face found in a still image.
#[derive(Debug, Clone)]
pub struct Recognized {
    pub region: FaceRegion,
    /// `None` when the face could not be embedded.
    pub identity: Option<MatchResult>,
}

impl Recognized {
    pub fn name(&self) -> &str {
        self.identity
            .as_ref()
            .map(|m| m.name())
            .unwrap_or(rollcall_core::UNKNOWN_LABEL)
    }
}

/// Identify every face in `frame`.
pub fn recognize_frame(
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    matcher: &IdentityMatcher,
    frame: &Frame,
) -> Result<Vec<Recognized>> {
    let regions = detector.detect(frame).context("face detection")?;
    let faces = regions
        .into_iter()
        .map(|region| {
            let identity = match embedder.embed(frame, &region) {
                Ok(embedding) => Some(matcher.identify(&embedding)),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed");
                    None
                }
            };
            Recognized { region, identity }
        })
        .collect();
    Ok(faces)
}

pub fn recognize_image(
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    matcher: &IdentityMatcher,
    path: &Path,
) -> Result<(Frame, Vec<Recognized>)> {
    let frame = load_frame(path)?;
    let faces = recognize_frame(detector, embedder, matcher, &frame)?;
    tracing::info!(image = %path.display(), faces = faces.len(), "image recognized");
    Ok((frame, faces))
}

/// Write `frame` with a box around each recognized face.
pub fn save_annotated(mut frame: Frame, faces: &[Recognized], path: &Path) -> Result<()> {
    for face in faces {
        frame.draw_rect(&face.region, ANNOTATION_INTENSITY, ANNOTATION_THICKNESS);
    }
    let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))
}
