//! rollcall-core: identity matching, liveness, attendance and the capture pipeline.
//!
//! Everything here is model- and device-agnostic: detection, embedding,
//! emotion inference and frame acquisition come in through the traits in
//! [`capability`].

pub mod attendance;
pub mod capability;
pub mod emotion;
pub mod enroll;
pub mod frame;
pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod queue;
pub mod types;

pub use attendance::{AttendanceLedger, AttendanceRecord, Status};
pub use capability::{CapabilityError, EmotionModel, FaceDetector, FaceEmbedder, FrameSource};
pub use emotion::{Emotion, EmotionBackend, EmotionScores, EmotionSmoother};
pub use frame::Frame;
pub use gallery::{EmbeddingStore, GalleryError};
pub use liveness::{LivenessConfig, LivenessSession, LivenessState};
pub use matcher::{EuclideanMatcher, IdentityMatcher, MatchResult, Matcher};
pub use pipeline::{CapturePipeline, FrameAnalyzer, Mode, Models, PipelineConfig, ResultEvent};
pub use types::{Embedding, FaceRegion, UNKNOWN_LABEL};
