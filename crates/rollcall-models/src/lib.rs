//! rollcall-models: ONNX Runtime implementations of the detection,
//! embedding and emotion capabilities.
//!
//! UltraFace for detection, ArcFace for embeddings and FER+/FER-2013
//! networks for emotion, all on CPU.

pub mod detector;
pub mod embedder;
pub mod emotion;
pub mod preprocess;

pub use detector::{DetectorError, UltraFaceDetector};
pub use embedder::{ArcFaceEmbedder, EmbedderError, ARCFACE_EMBEDDING_DIM};
pub use emotion::{EmotionLayout, EmotionModelError, EmotionNet};

use rollcall_core::{EmotionBackend, EmotionModel};

/// Load the primary emotion model, else the fallback, else the stub.
///
/// Load failures are logged and never fatal.
pub fn load_emotion_backend(primary: &str, fallback: &str) -> EmotionBackend {
    let load = |path: &str, layout| -> Option<Box<dyn EmotionModel>> {
        match EmotionNet::load(path, layout) {
            Ok(net) => Some(Box::new(net)),
            Err(e) => {
                tracing::warn!(path, error = %e, "emotion model unavailable");
                None
            }
        }
    };
    let primary = load(primary, EmotionLayout::FerPlus);
    // Only probe the fallback when the primary is missing.
    let fallback = if primary.is_none() {
        load(fallback, EmotionLayout::Fer2013)
    } else {
        None
    };
    EmotionBackend::select(primary, fallback)
}
