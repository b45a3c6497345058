//! Active liveness verification from blink and head-motion evidence.
//!
//! A session collects two independent evidence streams per observed frame:
//!
//! - **Blinks**: a run of `blink_frames` consecutive frames whose eye aspect
//!   ratio sits below `ear_threshold` counts as one blink. A single dark frame
//!   followed by an open eye resets the run and counts nothing.
//! - **Motion**: face centres are kept in a bounded ring buffer; once at least
//!   ten samples exist, the summed variance of the centre coordinates
//!   (scaled by 1/1000) must exceed `movement_threshold`.
//!
//! Verification needs both kinds of evidence *and* the full check duration.
//! A printed photo waved in front of the camera moves but never blinks; a
//! looping video may blink but still has to hold up for the whole window.

use crate::frame::{Crop, Frame};
use crate::types::FaceRegion;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples required before motion is evaluated at all.
const MIN_POSE_SAMPLES: usize = 10;
/// Divisor applied to the centre variance to form the movement score.
const MOVEMENT_NORMALIZER: f32 = 1000.0;

/// EAR reported when no eye can be located; never counts as a closed eye.
pub const OPEN_EYE_EAR: f32 = 1.0;
/// Minimum (mean - min) brightness spread for an eye window to hold an eye.
const MIN_EYE_CONTRAST: f32 = 20.0;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Minimum time a session must run before it can verify.
    pub check_duration: Duration,
    /// Sessions still collecting after this long time out.
    pub timeout: Duration,
    pub ear_threshold: f32,
    /// Consecutive low-EAR frames that make up one blink.
    pub blink_frames: u32,
    pub min_blinks: u32,
    pub movement_threshold: f32,
    /// Capacity of the face pose ring buffer.
    pub pose_history: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_duration: Duration::from_secs(3),
            timeout: Duration::from_secs(15),
            ear_threshold: 0.21,
            blink_frames: 2,
            min_blinks: 1,
            movement_threshold: 0.5,
            pose_history: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Collecting,
    Verified,
    TimedOut,
    Cancelled,
}

impl LivenessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LivenessState::Collecting)
    }
}

#[derive(Debug, Clone, Copy)]
struct PoseSample {
    center_x: f32,
    center_y: f32,
}

/// Snapshot of a session for UI feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessReport {
    pub state: LivenessState,
    pub has_blinked: bool,
    pub has_moved: bool,
    pub blinks: u32,
    pub movement_score: f32,
    pub elapsed: Duration,
    /// `elapsed / check_duration` as a percentage, capped at 100.
    pub progress: f32,
    pub status: String,
}

/// One verification attempt. Owned by the caller that started it.
#[derive(Debug)]
pub struct LivenessSession {
    config: LivenessConfig,
    started_at: Instant,
    blink_count: u32,
    consecutive_low_ear: u32,
    poses: VecDeque<PoseSample>,
    state: LivenessState,
}

impl LivenessSession {
    pub fn start(config: LivenessConfig, now: Instant) -> Self {
        let capacity = config.pose_history.max(MIN_POSE_SAMPLES);
        Self {
            config,
            started_at: now,
            blink_count: 0,
            consecutive_low_ear: 0,
            poses: VecDeque::with_capacity(capacity),
            state: LivenessState::Collecting,
        }
    }

    /// Feed one frame of evidence and advance the state machine.
    ///
    /// Terminal sessions ignore further evidence.
    pub fn observe(&mut self, now: Instant, ear: f32, region: &FaceRegion) -> LivenessReport {
        if self.state.is_terminal() {
            return self.report(now);
        }

        self.record_blink_evidence(ear);
        self.record_pose(region);

        let elapsed = self.elapsed(now);
        if self.has_blinked() && self.has_moved() && elapsed >= self.config.check_duration {
            self.state = LivenessState::Verified;
            tracing::debug!(
                blinks = self.blink_count,
                movement = self.movement_score(),
                elapsed_ms = elapsed.as_millis() as u64,
                "liveness verified"
            );
        } else if elapsed > self.config.timeout {
            self.state = LivenessState::TimedOut;
            tracing::debug!(
                blinked = self.has_blinked(),
                moved = self.has_moved(),
                "liveness timed out"
            );
        }

        self.report(now)
    }

    /// Apply the timeout without new evidence (e.g. the face left the frame).
    pub fn poll(&mut self, now: Instant) -> LivenessState {
        if self.state == LivenessState::Collecting && self.elapsed(now) > self.config.timeout {
            self.state = LivenessState::TimedOut;
        }
        self.state
    }

    /// Abort the session. No effect once terminal.
    pub fn cancel(&mut self) {
        if self.state == LivenessState::Collecting {
            self.state = LivenessState::Cancelled;
        }
    }

    fn record_blink_evidence(&mut self, ear: f32) {
        if ear < self.config.ear_threshold {
            self.consecutive_low_ear += 1;
            if self.consecutive_low_ear >= self.config.blink_frames.max(1) {
                self.blink_count += 1;
                self.consecutive_low_ear = 0;
            }
        } else {
            self.consecutive_low_ear = 0;
        }
    }

    fn record_pose(&mut self, region: &FaceRegion) {
        if self.poses.len() >= self.config.pose_history.max(MIN_POSE_SAMPLES) {
            self.poses.pop_front();
        }
        let (center_x, center_y) = region.center();
        self.poses.push_back(PoseSample {
            center_x,
            center_y,
        });
    }

    /// Normalised variance of the buffered face centres (0.0 until enough samples).
    pub fn movement_score(&self) -> f32 {
        if self.poses.len() < MIN_POSE_SAMPLES {
            return 0.0;
        }
        let xs: Vec<f32> = self.poses.iter().map(|p| p.center_x).collect();
        let ys: Vec<f32> = self.poses.iter().map(|p| p.center_y).collect();
        (variance(&xs) + variance(&ys)) / MOVEMENT_NORMALIZER
    }

    pub fn has_blinked(&self) -> bool {
        self.blink_count >= self.config.min_blinks.max(1)
    }

    pub fn has_moved(&self) -> bool {
        self.movement_score() > self.config.movement_threshold
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn progress(&self, now: Instant) -> f32 {
        let duration = self.config.check_duration.as_secs_f32();
        if duration <= 0.0 {
            return 100.0;
        }
        (self.elapsed(now).as_secs_f32() / duration * 100.0).min(100.0)
    }

    pub fn report(&self, now: Instant) -> LivenessReport {
        let elapsed = self.elapsed(now);
        let progress = self.progress(now);
        let has_blinked = self.has_blinked();
        let has_moved = self.has_moved();

        let status = match self.state {
            LivenessState::Verified => "Live person detected".to_string(),
            LivenessState::TimedOut => "Liveness check timed out".to_string(),
            LivenessState::Cancelled => "Liveness check cancelled".to_string(),
            LivenessState::Collecting if elapsed < self.config.check_duration => {
                format!("Liveness check: {progress:.0}%")
            }
            LivenessState::Collecting if !has_blinked => "Please blink".to_string(),
            LivenessState::Collecting => "Please move your head".to_string(),
        };

        LivenessReport {
            state: self.state,
            has_blinked,
            has_moved,
            blinks: self.blink_count,
            movement_score: self.movement_score(),
            elapsed,
            progress,
            status,
        }
    }
}

fn variance(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

/// Estimate an eye-aspect-ratio-like openness score for a face region.
///
/// Looks at the eye band (20–50 % of face height), splits it into a left and a
/// right window, and measures the height/width ratio of the dark blob in each.
/// An open eye shows a roughly round iris; a closed lid collapses it into a
/// thin line. Returns [`OPEN_EYE_EAR`] when neither window holds an eye.
pub fn eye_aspect_ratio(frame: &Frame, region: &FaceRegion) -> f32 {
    let Some(face) = frame.crop(region) else {
        return OPEN_EYE_EAR;
    };
    if face.width < 8 || face.height < 8 {
        return OPEN_EYE_EAR;
    }

    let band_top = (face.height as f32 * 0.20) as usize;
    let band_bottom = (face.height as f32 * 0.50) as usize;
    let windows = [
        ((face.width as f32 * 0.10) as usize, (face.width as f32 * 0.48) as usize),
        ((face.width as f32 * 0.52) as usize, (face.width as f32 * 0.90) as usize),
    ];

    let ratios: Vec<f32> = windows
        .iter()
        .filter_map(|&(x0, x1)| dark_blob_ratio(&face, x0, x1, band_top, band_bottom))
        .collect();

    if ratios.is_empty() {
        OPEN_EYE_EAR
    } else {
        ratios.iter().sum::<f32>() / ratios.len() as f32
    }
}

/// Height/width ratio of the dark pixels inside a window, if any stand out.
fn dark_blob_ratio(face: &Crop, x0: usize, x1: usize, y0: usize, y1: usize) -> Option<f32> {
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let mut sum = 0.0f32;
    let mut min = u8::MAX;
    for y in y0..y1 {
        for x in x0..x1 {
            let p = face.pixel(x, y);
            sum += p as f32;
            min = min.min(p);
        }
    }
    let mean = sum / ((x1 - x0) * (y1 - y0)) as f32;
    if mean - (min as f32) < MIN_EYE_CONTRAST {
        return None;
    }
    let cutoff = min as f32 + (mean - min as f32) * 0.5;

    let (mut bx0, mut by0, mut bx1, mut by1) = (usize::MAX, usize::MAX, 0usize, 0usize);
    for y in y0..y1 {
        for x in x0..x1 {
            if (face.pixel(x, y) as f32) <= cutoff {
                bx0 = bx0.min(x);
                by0 = by0.min(y);
                bx1 = bx1.max(x);
                by1 = by1.max(y);
            }
        }
    }
    if bx0 == usize::MAX {
        return None;
    }

    let blob_w = (bx1 - bx0 + 1) as f32;
    let blob_h = (by1 - by0 + 1) as f32;
    Some(blob_h / blob_w)
}
