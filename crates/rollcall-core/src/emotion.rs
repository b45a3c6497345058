//! Emotion labels, temporal smoothing and backend selection.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Fixed emotion label set.
///
/// Declaration order is the tie-break priority used by [`EmotionScores::dominant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprise,
    Fear,
    Disgust,
}

impl Emotion {
    /// All labels in priority order.
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprise => "surprise",
            Emotion::Fear => "fear",
            Emotion::Disgust => "disgust",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probability per [`Emotion`], indexed in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionScores(pub [f32; 7]);

impl EmotionScores {
    pub fn uniform() -> Self {
        Self([1.0 / 7.0; 7])
    }

    /// All mass on a single label.
    pub fn one_hot(emotion: Emotion) -> Self {
        let mut scores = [0.0; 7];
        scores[emotion.index()] = 1.0;
        Self(scores)
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.0[emotion.index()]
    }

    /// Highest-scoring label; exact ties go to the higher-priority label.
    pub fn dominant(&self) -> Emotion {
        let mut best = Emotion::Neutral;
        for emotion in Emotion::ALL {
            if self.get(emotion) > self.get(best) {
                best = emotion;
            }
        }
        best
    }

    pub fn confidence(&self) -> f32 {
        self.get(self.dominant())
    }
}

/// Moving average over the last `capacity` emotion observations.
#[derive(Debug, Clone)]
pub struct EmotionSmoother {
    capacity: usize,
    buffer: VecDeque<EmotionScores>,
}

impl EmotionSmoother {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    pub fn observe(&mut self, raw: EmotionScores) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(raw);
    }

    /// Per-label mean of the buffered observations; `None` before any observation.
    pub fn smoothed(&self) -> Option<EmotionScores> {
        if self.buffer.is_empty() {
            return None;
        }
        let n = self.buffer.len() as f32;
        let mut mean = [0.0f32; 7];
        for scores in &self.buffer {
            for (acc, v) in mean.iter_mut().zip(scores.0.iter()) {
                *acc += v;
            }
        }
        for v in &mut mean {
            *v /= n;
        }
        Some(EmotionScores(mean))
    }

    /// Observe `raw` and return the updated mean.
    pub fn smooth(&mut self, raw: EmotionScores) -> EmotionScores {
        self.observe(raw);
        self.smoothed().unwrap_or(raw)
    }

    pub fn dominant(&self) -> Option<Emotion> {
        self.smoothed().map(|s| s.dominant())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Which emotion estimator is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmotionVariant {
    Primary,
    Fallback,
    Stub,
}

impl fmt::Display for EmotionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmotionVariant::Primary => "primary",
            EmotionVariant::Fallback => "fallback",
            EmotionVariant::Stub => "stub",
        })
    }
}

/// Emotion estimator chosen once at construction.
///
/// The first available model wins; with none, the stub answers every request
/// with the uniform distribution.
pub enum EmotionBackend {
    Primary(Box<dyn crate::capability::EmotionModel>),
    Fallback(Box<dyn crate::capability::EmotionModel>),
    Stub,
}

impl EmotionBackend {
    pub fn select(
        primary: Option<Box<dyn crate::capability::EmotionModel>>,
        fallback: Option<Box<dyn crate::capability::EmotionModel>>,
    ) -> Self {
        let backend = match (primary, fallback) {
            (Some(model), _) => EmotionBackend::Primary(model),
            (None, Some(model)) => EmotionBackend::Fallback(model),
            (None, None) => EmotionBackend::Stub,
        };
        tracing::info!(backend = %backend.variant(), "emotion backend selected");
        backend
    }

    pub fn variant(&self) -> EmotionVariant {
        match self {
            EmotionBackend::Primary(_) => EmotionVariant::Primary,
            EmotionBackend::Fallback(_) => EmotionVariant::Fallback,
            EmotionBackend::Stub => EmotionVariant::Stub,
        }
    }

    /// Predict scores for one face. Model failures degrade to uniform scores.
    pub fn predict(
        &mut self,
        frame: &crate::frame::Frame,
        region: &crate::types::FaceRegion,
    ) -> EmotionScores {
        let model = match self {
            EmotionBackend::Primary(model) | EmotionBackend::Fallback(model) => model,
            EmotionBackend::Stub => return EmotionScores::uniform(),
        };
        match model.predict(frame, region) {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(error = %e, "emotion prediction failed");
                EmotionScores::uniform()
            }
        }
    }
}
