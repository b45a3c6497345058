//! Capture pipeline: one producer thread feeding two bounded queues.
//!
//! The producer owns the camera, the models, the gallery, the attendance
//! ledger and every liveness session. The consumer (UI or CLI loop) only
//! drains the display queue and the result queue, and sends registration or
//! mode-switch requests over a small command channel. Nothing else is shared.

use crate::attendance::{classify_status, AttendanceLedger, Status};
use crate::capability::{CapabilityError, FaceDetector, FaceEmbedder, FrameSource};
use crate::emotion::{EmotionBackend, EmotionScores, EmotionSmoother};
use crate::enroll::{enroll_from_frame, RegistrationFailure};
use crate::frame::Frame;
use crate::gallery::EmbeddingStore;
use crate::liveness::{
    eye_aspect_ratio, LivenessConfig, LivenessReport, LivenessSession, LivenessState,
};
use crate::matcher::{IdentityMatcher, MatchResult};
use crate::queue::{BoundedQueue, Overflow};
use crate::types::FaceRegion;
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DISPLAY_QUEUE_CAPACITY: usize = 2;
pub const RESULT_QUEUE_CAPACITY: usize = 10;
const COMMAND_CHANNEL_CAPACITY: usize = 4;
const BOX_INTENSITY: u8 = 255;
const BOX_THICKNESS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Label and emotion for every face.
    Recognize,
    /// Recognize and mark attendance, optionally behind a liveness check.
    Attendance,
    /// Boxes only; registration requests enroll the current frame.
    Register,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Recognize => "recognize",
            Mode::Attendance => "attendance",
            Mode::Register => "register",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// Run detection on every n-th frame; other frames reuse the last result.
    pub analysis_interval: u32,
    /// Feed liveness evidence on every n-th analysis pass.
    pub liveness_interval: u32,
    pub require_liveness: bool,
    pub liveness: LivenessConfig,
    /// Absence after which a face's liveness session is cancelled.
    pub liveness_grace: Duration,
    pub emotion_enabled: bool,
    pub smoothing_window: usize,
    pub late_cutoff: Option<NaiveTime>,
    /// Attendance mode stops once the wall clock reaches this time.
    pub end_time: Option<NaiveTime>,
    pub loop_sleep: Duration,
    pub failure_backoff: Duration,
    /// Consecutive read failures before `CameraUnavailable` is emitted.
    pub camera_failure_limit: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Recognize,
            analysis_interval: 4,
            liveness_interval: 1,
            require_liveness: false,
            liveness: LivenessConfig::default(),
            liveness_grace: Duration::from_secs(1),
            emotion_enabled: true,
            smoothing_window: 5,
            late_cutoff: None,
            end_time: None,
            loop_sleep: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(100),
            camera_failure_limit: 3,
        }
    }
}

/// Discrete outcome delivered to the consumer through the result queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEvent {
    AttendanceMarked {
        name: String,
        status: Status,
        time: NaiveTime,
    },
    RegistrationSucceeded {
        label: String,
        id: Uuid,
        quality: f32,
    },
    RegistrationFailed {
        label: String,
        reason: RegistrationFailure,
    },
    LivenessVerified {
        label: String,
    },
    LivenessFailed {
        label: String,
        status: String,
    },
    CameraUnavailable {
        consecutive_failures: u32,
    },
    StorageFailed {
        message: String,
    },
    SessionEnded,
}

impl fmt::Display for ResultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultEvent::AttendanceMarked { name, status, time } => {
                write!(f, "{name} marked {status} at {}", time.format("%H:%M:%S"))
            }
            ResultEvent::RegistrationSucceeded { label, quality, .. } => {
                write!(f, "registered {label} (quality {quality:.2})")
            }
            ResultEvent::RegistrationFailed { label, reason } => {
                write!(f, "registration of {label} failed: {reason}")
            }
            ResultEvent::LivenessVerified { label } => write!(f, "{label}: live person detected"),
            ResultEvent::LivenessFailed { label, status } => write!(f, "{label}: {status}"),
            ResultEvent::CameraUnavailable {
                consecutive_failures,
            } => write!(f, "camera unavailable ({consecutive_failures} failed reads)"),
            ResultEvent::StorageFailed { message } => write!(f, "storage failure: {message}"),
            ResultEvent::SessionEnded => f.write_str("attendance session ended"),
        }
    }
}

/// What the consumer draws next to one face box.
#[derive(Debug, Clone)]
pub struct FaceAnnotation {
    pub region: FaceRegion,
    /// `None` in register mode or when embedding failed.
    pub identity: Option<MatchResult>,
    pub emotion: Option<EmotionScores>,
    pub liveness: Option<LivenessReport>,
    /// Already recorded in today's attendance.
    pub marked: bool,
}

impl FaceAnnotation {
    fn boxed(region: FaceRegion) -> Self {
        Self {
            region,
            identity: None,
            emotion: None,
            liveness: None,
            marked: false,
        }
    }

    pub fn caption(&self) -> String {
        let mut caption = match &self.identity {
            Some(identity) if identity.is_known() => {
                format!("{} ({:.2})", identity.name(), identity.distance)
            }
            Some(identity) => identity.name().to_string(),
            None => "face".to_string(),
        };
        if let Some(emotion) = &self.emotion {
            caption.push_str(&format!(" | {}", emotion.dominant()));
        }
        if let Some(liveness) = &self.liveness {
            caption.push_str(&format!(" | {}", liveness.status));
        }
        if self.marked {
            caption.push_str(" | marked");
        }
        caption
    }
}

/// Annotated frame ready for presentation.
#[derive(Clone)]
pub struct DisplayFrame {
    pub frame: Frame,
    pub faces: Vec<FaceAnnotation>,
    pub mode: Mode,
}

/// Inference capabilities owned by the analyzer.
pub struct Models {
    pub detector: Box<dyn FaceDetector>,
    pub embedder: Box<dyn FaceEmbedder>,
    pub emotion: EmotionBackend,
}

pub struct FrameOutput {
    pub display: DisplayFrame,
    pub events: Vec<ResultEvent>,
}

struct TrackedSession {
    session: LivenessSession,
    last_seen: Instant,
}

/// Per-frame analysis step, independent of threads and wall-clock sources.
pub struct FrameAnalyzer {
    config: PipelineConfig,
    matcher: IdentityMatcher,
    ledger: AttendanceLedger,
    models: Models,
    sessions: HashMap<String, TrackedSession>,
    smoothers: HashMap<String, EmotionSmoother>,
    frame_count: u64,
    analysis_count: u64,
    last_faces: Vec<FaceAnnotation>,
    session_ended: bool,
}

impl FrameAnalyzer {
    pub fn new(
        config: PipelineConfig,
        matcher: IdentityMatcher,
        ledger: AttendanceLedger,
        models: Models,
    ) -> Self {
        Self {
            config,
            matcher,
            ledger,
            models,
            sessions: HashMap::new(),
            smoothers: HashMap::new(),
            frame_count: 0,
            analysis_count: 0,
            last_faces: Vec::new(),
            session_ended: false,
        }
    }

    /// Process one captured frame.
    ///
    /// `now` drives liveness timing, `wall` drives attendance timestamps and
    /// the session end time. `registrations` are labels to enroll from this frame.
    pub fn process(
        &mut self,
        frame: Frame,
        now: Instant,
        wall: NaiveDateTime,
        registrations: &[String],
    ) -> FrameOutput {
        let mut events = Vec::new();
        self.frame_count += 1;
        self.check_end_time(wall, &mut events);

        for label in registrations {
            self.register(&frame, label, &mut events);
        }

        let interval = u64::from(self.config.analysis_interval.max(1));
        if (self.frame_count - 1) % interval == 0 {
            match self.analyse(&frame, now, wall, &mut events) {
                Ok(faces) => self.last_faces = faces,
                Err(e) => tracing::warn!(error = %e, "face analysis failed"),
            }
            self.sweep_sessions(now, &mut events);
        }

        let mut display = frame;
        for face in &self.last_faces {
            display.draw_rect(&face.region, BOX_INTENSITY, BOX_THICKNESS);
        }
        FrameOutput {
            display: DisplayFrame {
                frame: display,
                faces: self.last_faces.clone(),
                mode: self.config.mode,
            },
            events,
        }
    }

    fn check_end_time(&mut self, wall: NaiveDateTime, events: &mut Vec<ResultEvent>) {
        if self.session_ended || self.config.mode != Mode::Attendance {
            return;
        }
        if let Some(end) = self.config.end_time {
            if wall.time() >= end {
                tracing::info!(end = %end.format("%H:%M"), "attendance session ended");
                self.session_ended = true;
                events.push(ResultEvent::SessionEnded);
            }
        }
    }

    fn register(&mut self, frame: &Frame, label: &str, events: &mut Vec<ResultEvent>) {
        let Models {
            detector, embedder, ..
        } = &mut self.models;
        match enroll_from_frame(
            detector.as_mut(),
            embedder.as_mut(),
            &mut self.matcher,
            frame,
            label,
        ) {
            Ok(enrolled) => events.push(ResultEvent::RegistrationSucceeded {
                label: enrolled.label,
                id: enrolled.id,
                quality: enrolled.quality.overall,
            }),
            Err(RegistrationFailure::Storage(message)) => {
                tracing::error!(label, error = %message, "registration not persisted");
                events.push(ResultEvent::StorageFailed {
                    message: message.clone(),
                });
                events.push(ResultEvent::RegistrationFailed {
                    label: label.trim().to_string(),
                    reason: RegistrationFailure::Storage(message),
                });
            }
            Err(reason) => {
                tracing::debug!(label, reason = %reason, "registration rejected");
                events.push(ResultEvent::RegistrationFailed {
                    label: label.trim().to_string(),
                    reason,
                });
            }
        }
    }

    fn analyse(
        &mut self,
        frame: &Frame,
        now: Instant,
        wall: NaiveDateTime,
        events: &mut Vec<ResultEvent>,
    ) -> Result<Vec<FaceAnnotation>, CapabilityError> {
        let regions = self.models.detector.detect(frame)?;
        self.analysis_count += 1;

        if self.config.mode == Mode::Register {
            return Ok(regions.into_iter().map(FaceAnnotation::boxed).collect());
        }

        let liveness_pass =
            (self.analysis_count - 1) % u64::from(self.config.liveness_interval.max(1)) == 0;
        let mut faces = Vec::with_capacity(regions.len());

        for region in regions {
            let embedding = match self.models.embedder.embed(frame, &region) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed");
                    faces.push(FaceAnnotation::boxed(region));
                    continue;
                }
            };
            let identity = self.matcher.identify(&embedding);
            let mut face = FaceAnnotation::boxed(region);

            if self.config.emotion_enabled {
                face.emotion = Some(self.emotion_for(frame, &region, identity.label.as_deref()));
            }
            if let (Some(label), Mode::Attendance) = (identity.label.as_deref(), self.config.mode) {
                self.attend(label, frame, &region, now, wall, liveness_pass, &mut face, events);
            }

            face.identity = Some(identity);
            faces.push(face);
        }
        Ok(faces)
    }

    fn emotion_for(&mut self, frame: &Frame, region: &FaceRegion, label: Option<&str>) -> EmotionScores {
        let raw = self.models.emotion.predict(frame, region);
        let Some(label) = label else {
            return raw;
        };
        let window = self.config.smoothing_window;
        self.smoothers
            .entry(label.to_string())
            .or_insert_with(|| EmotionSmoother::new(window))
            .smooth(raw)
    }

    #[allow(clippy::too_many_arguments)]
    fn attend(
        &mut self,
        label: &str,
        frame: &Frame,
        region: &FaceRegion,
        now: Instant,
        wall: NaiveDateTime,
        liveness_pass: bool,
        face: &mut FaceAnnotation,
        events: &mut Vec<ResultEvent>,
    ) {
        if self.ledger.current_date() == wall.date() && self.ledger.has_marked(label) {
            face.marked = true;
            return;
        }

        if self.config.require_liveness {
            let report = self.observe_liveness(label, frame, region, now, liveness_pass);
            let state = report.state;
            let status = report.status.clone();
            face.liveness = Some(report);
            match state {
                LivenessState::Verified => {
                    self.sessions.remove(label);
                    events.push(ResultEvent::LivenessVerified {
                        label: label.to_string(),
                    });
                }
                LivenessState::TimedOut => {
                    self.sessions.remove(label);
                    tracing::info!(label, "liveness check timed out");
                    events.push(ResultEvent::LivenessFailed {
                        label: label.to_string(),
                        status,
                    });
                    return;
                }
                LivenessState::Collecting | LivenessState::Cancelled => return,
            }
        }

        let status = classify_status(wall.time(), self.config.late_cutoff);
        match self.ledger.mark_at(label, status, wall) {
            Ok(true) => {
                face.marked = true;
                events.push(ResultEvent::AttendanceMarked {
                    name: label.to_string(),
                    status,
                    time: wall.time(),
                });
            }
            Ok(false) => face.marked = self.ledger.has_marked(label),
            Err(e) => {
                tracing::error!(label, error = %e, "failed to record attendance");
                events.push(ResultEvent::StorageFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn observe_liveness(
        &mut self,
        label: &str,
        frame: &Frame,
        region: &FaceRegion,
        now: Instant,
        liveness_pass: bool,
    ) -> LivenessReport {
        let config = &self.config.liveness;
        let tracked = self.sessions.entry(label.to_string()).or_insert_with(|| {
            tracing::debug!(label, "liveness session started");
            TrackedSession {
                session: LivenessSession::start(config.clone(), now),
                last_seen: now,
            }
        });
        tracked.last_seen = now;

        if liveness_pass {
            let ear = eye_aspect_ratio(frame, region);
            tracked.session.observe(now, ear, region)
        } else {
            tracked.session.poll(now);
            tracked.session.report(now)
        }
    }

    /// Time out or cancel sessions whose face is no longer being observed.
    fn sweep_sessions(&mut self, now: Instant, events: &mut Vec<ResultEvent>) {
        let grace = self.config.liveness_grace;
        let mut finished = Vec::new();
        for (label, tracked) in self.sessions.iter_mut() {
            if tracked.session.poll(now) == LivenessState::TimedOut {
                finished.push((label.clone(), Some(tracked.session.report(now).status)));
            } else if now.saturating_duration_since(tracked.last_seen) > grace {
                tracked.session.cancel();
                finished.push((label.clone(), None));
            }
        }

        for (label, timed_out) in finished {
            self.sessions.remove(&label);
            match timed_out {
                Some(status) => events.push(ResultEvent::LivenessFailed { label, status }),
                None => tracing::debug!(label = %label, "face left the frame; liveness cancelled"),
            }
        }
    }

    /// Switch modes. In-flight liveness sessions are cancelled.
    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.config.mode {
            tracing::info!(from = %self.config.mode, to = %mode, "pipeline mode changed");
            self.cancel_sessions();
            self.last_faces.clear();
            self.config.mode = mode;
        }
    }

    pub fn cancel_sessions(&mut self) {
        for tracked in self.sessions.values_mut() {
            tracked.session.cancel();
        }
        self.sessions.clear();
    }

    pub fn session_ended(&self) -> bool {
        self.session_ended
    }

    pub fn active_liveness_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn matcher(&self) -> &IdentityMatcher {
        &self.matcher
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn into_parts(self) -> (EmbeddingStore, AttendanceLedger) {
        (self.matcher.into_store(), self.ledger)
    }
}

enum PipelineCommand {
    Register(String),
    SetMode(Mode),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread panicked")]
    Panicked,
}

/// Handle to the running capture thread.
pub struct CapturePipeline {
    display: Arc<BoundedQueue<DisplayFrame>>,
    results: Arc<BoundedQueue<ResultEvent>>,
    running: Arc<AtomicBool>,
    commands: mpsc::Sender<PipelineCommand>,
    handle: Option<JoinHandle<(EmbeddingStore, AttendanceLedger)>>,
}

impl CapturePipeline {
    /// Spawn the producer thread. It runs until [`stop`](Self::stop), the
    /// session end time, or the handle being dropped.
    pub fn start(
        source: Box<dyn FrameSource>,
        analyzer: FrameAnalyzer,
    ) -> Result<Self, PipelineError> {
        let display = Arc::new(BoundedQueue::new(DISPLAY_QUEUE_CAPACITY, Overflow::DropOldest));
        let results = Arc::new(BoundedQueue::new(RESULT_QUEUE_CAPACITY, Overflow::DropNewest));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let worker = CaptureLoop {
            source,
            analyzer,
            display: Arc::clone(&display),
            results: Arc::clone(&results),
            running: Arc::clone(&running),
            commands: rx,
        };
        let handle = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || worker.run())
            .map_err(PipelineError::Spawn)?;

        Ok(Self {
            display,
            results,
            running,
            commands: tx,
            handle: Some(handle),
        })
    }

    /// Latest annotated frame, if any. Never blocks.
    pub fn next_display_frame(&self) -> Option<DisplayFrame> {
        self.display.pop()
    }

    /// Oldest pending event, if any. Never blocks.
    pub fn next_event(&self) -> Option<ResultEvent> {
        self.results.pop()
    }

    /// Ask the producer to enroll the face in its next frame under `label`.
    ///
    /// Returns `false` when the request could not be queued.
    pub fn request_registration(&self, label: &str) -> bool {
        self.send(PipelineCommand::Register(label.to_string()))
    }

    pub fn set_mode(&self, mode: Mode) -> bool {
        self.send(PipelineCommand::SetMode(mode))
    }

    fn send(&self, command: PipelineCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline command not delivered");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag. The producer exits within one iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop the producer and take back the gallery and ledger.
    pub fn join(mut self) -> Result<(EmbeddingStore, AttendanceLedger), PipelineError> {
        self.stop();
        let handle = self.handle.take().ok_or(PipelineError::Panicked)?;
        handle.join().map_err(|_| PipelineError::Panicked)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    source: Box<dyn FrameSource>,
    analyzer: FrameAnalyzer,
    display: Arc<BoundedQueue<DisplayFrame>>,
    results: Arc<BoundedQueue<ResultEvent>>,
    running: Arc<AtomicBool>,
    commands: mpsc::Receiver<PipelineCommand>,
}

impl CaptureLoop {
    fn run(mut self) -> (EmbeddingStore, AttendanceLedger) {
        let config = self.analyzer.config().clone();
        tracing::info!(mode = %config.mode, "capture thread started");

        let mut consecutive_failures: u32 = 0;
        let mut unavailable_reported = false;

        while self.running.load(Ordering::Acquire) {
            let frame = match self.source.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %e, consecutive_failures, "frame read failed");
                    if consecutive_failures >= config.camera_failure_limit && !unavailable_reported {
                        unavailable_reported = true;
                        self.emit(ResultEvent::CameraUnavailable {
                            consecutive_failures,
                        });
                    }
                    std::thread::sleep(config.failure_backoff);
                    continue;
                }
            };
            if consecutive_failures > 0 {
                tracing::info!(after = consecutive_failures, "camera recovered");
            }
            consecutive_failures = 0;
            unavailable_reported = false;

            let registrations = self.drain_commands();
            let output = self.analyzer.process(
                frame,
                Instant::now(),
                Local::now().naive_local(),
                &registrations,
            );
            self.display.push(output.display);
            for event in output.events {
                self.emit(event);
            }

            if self.analyzer.session_ended() {
                self.running.store(false, Ordering::Release);
                break;
            }
            std::thread::sleep(config.loop_sleep);
        }

        self.analyzer.cancel_sessions();
        self.source.release();
        tracing::info!("capture thread exiting");
        self.analyzer.into_parts()
    }

    /// Apply mode switches and collect pending registration labels.
    fn drain_commands(&mut self) -> Vec<String> {
        let mut registrations = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PipelineCommand::Register(label) => registrations.push(label),
                PipelineCommand::SetMode(mode) => self.analyzer.set_mode(mode),
            }
        }
        registrations
    }

    fn emit(&self, event: ResultEvent) {
        if !self.results.push(event) {
            tracing::debug!("result queue full; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EmotionModel;
    use crate::emotion::{Emotion, EmotionVariant};
    use crate::types::Embedding;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicUsize;

    const ALICE: [f32; 4] = [1.0, 0.0, 0.0, 0.0];
    const STRANGER: [f32; 4] = [0.0, 0.0, 0.0, 5.0];
    const BACKGROUND: u8 = 40;
    const SKIN: u8 = 180;
    const IRIS: u8 = 20;
    const FRAME_W: usize = 320;
    const FRAME_H: usize = 240;

    /// Returns the bounding box of all bright pixels as the single face.
    struct BrightBoxDetector {
        calls: Arc<AtomicUsize>,
    }

    impl FaceDetector for BrightBoxDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let w = frame.width as usize;
            let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
            for (i, &p) in frame.data.iter().enumerate() {
                if p >= 150 {
                    x0 = x0.min(i % w);
                    y0 = y0.min(i / w);
                    x1 = x1.max(i % w);
                    y1 = y1.max(i / w);
                }
            }
            if x0 == usize::MAX {
                return Ok(Vec::new());
            }
            Ok(vec![FaceRegion::new(
                y0 as f32,
                (x1 + 1) as f32,
                (y1 + 1) as f32,
                x0 as f32,
            )])
        }
    }

    struct FixedDetector(Vec<FaceRegion>);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _: &Frame) -> Result<Vec<FaceRegion>, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    struct FixedEmbedder(Vec<f32>);

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _: &Frame, _: &FaceRegion) -> Result<Embedding, CapabilityError> {
            Ok(Embedding::new(self.0.clone()))
        }
    }

    struct AlwaysHappy;

    impl EmotionModel for AlwaysHappy {
        fn predict(&mut self, _: &Frame, _: &FaceRegion) -> Result<EmotionScores, CapabilityError> {
            Ok(EmotionScores::one_hot(Emotion::Happy))
        }
    }

    /// 320x240 frame with a 100x100 face at (x, y); eyes 8 px tall when open.
    fn face_frame(x: usize, y: usize, eyes_open: bool) -> Frame {
        let mut data = vec![BACKGROUND; FRAME_W * FRAME_H];
        for row in y..y + 100 {
            for col in x..x + 100 {
                data[row * FRAME_W + col] = SKIN;
            }
        }
        let (eye_top, eye_height) = if eyes_open { (30, 8) } else { (34, 1) };
        for (c0, c1) in [(20, 32), (65, 77)] {
            for row in y + eye_top..y + eye_top + eye_height {
                for col in x + c0..x + c1 {
                    data[row * FRAME_W + col] = IRIS;
                }
            }
        }
        Frame::new(data, FRAME_W as u32, FRAME_H as u32, 0)
    }

    fn empty_frame() -> Frame {
        Frame::new(vec![BACKGROUND; FRAME_W * FRAME_H], FRAME_W as u32, FRAME_H as u32, 0)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn morning() -> NaiveDateTime {
        day().and_hms_opt(8, 0, 0).unwrap()
    }

    struct Harness {
        analyzer: FrameAnalyzer,
        detector_calls: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn harness(config: PipelineConfig, probe: [f32; 4]) -> Harness {
        harness_with(config, probe, EmotionBackend::select(None, None))
    }

    fn harness_with(config: PipelineConfig, probe: [f32; 4], emotion: EmotionBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddingStore::open(dir.path().join("gallery.json"), 4).unwrap();
        store.register("Alice", ALICE.to_vec()).unwrap();
        let ledger = AttendanceLedger::open_for(dir.path().join("attendance.csv"), day()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let models = Models {
            detector: Box::new(BrightBoxDetector {
                calls: Arc::clone(&calls),
            }),
            embedder: Box::new(FixedEmbedder(probe.to_vec())),
            emotion,
        };
        Harness {
            analyzer: FrameAnalyzer::new(config, IdentityMatcher::new(store, 0.6), ledger, models),
            detector_calls: calls,
            _dir: dir,
        }
    }

    fn every_frame(mode: Mode) -> PipelineConfig {
        PipelineConfig {
            mode,
            analysis_interval: 1,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_recognizes_enrolled_face() {
        let mut h = harness(every_frame(Mode::Recognize), ALICE);
        let out = h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        assert_eq!(out.display.faces.len(), 1);
        let face = &out.display.faces[0];
        assert_eq!(face.identity.as_ref().unwrap().name(), "Alice");
        assert!(face.caption().starts_with("Alice"));
        assert!(out.events.is_empty());
        // Recognize mode never touches the ledger.
        assert!(h.analyzer.ledger().today().is_empty());
    }

    #[test]
    fn test_stranger_is_unknown() {
        let mut h = harness(every_frame(Mode::Attendance), STRANGER);
        let out = h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        assert_eq!(out.display.faces[0].identity.as_ref().unwrap().name(), "Unknown");
        assert!(out.events.is_empty());
        assert!(h.analyzer.ledger().today().is_empty());
    }

    #[test]
    fn test_analysis_interval_reuses_annotations() {
        let config = PipelineConfig {
            analysis_interval: 4,
            ..PipelineConfig::default()
        };
        let mut h = harness(config, ALICE);
        let t0 = Instant::now();
        for _ in 0..8 {
            let out = h.analyzer.process(face_frame(50, 50, true), t0, morning(), &[]);
            assert_eq!(out.display.faces.len(), 1);
            // Box outline drawn on every frame, analysed or not.
            assert_eq!(out.display.frame.data[50 * FRAME_W + 50], BOX_INTENSITY);
        }
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_attendance_marked_once() {
        let mut h = harness(every_frame(Mode::Attendance), ALICE);
        let t0 = Instant::now();
        let mut marked = 0;
        for _ in 0..5 {
            let out = h.analyzer.process(face_frame(50, 50, true), t0, morning(), &[]);
            assert!(out.display.faces[0].marked);
            marked += out
                .events
                .iter()
                .filter(|e| matches!(e, ResultEvent::AttendanceMarked { .. }))
                .count();
        }
        assert_eq!(marked, 1);
        assert_eq!(h.analyzer.ledger().today(), vec!["Alice".to_string()]);
    }

    #[test]
    fn test_late_cutoff_applied() {
        let config = PipelineConfig {
            late_cutoff: NaiveTime::from_hms_opt(7, 30, 0),
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        let out = h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        assert_eq!(
            out.events,
            vec![ResultEvent::AttendanceMarked {
                name: "Alice".into(),
                status: Status::Late,
                time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            }]
        );
    }

    #[test]
    fn test_liveness_gate_then_mark() {
        let config = PipelineConfig {
            require_liveness: true,
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        let t0 = Instant::now();
        let mut events = Vec::new();
        let mut marked_at = None;

        for i in 0..40usize {
            let x = if i % 2 == 0 { 60 } else { 140 };
            let y = if i % 4 < 2 { 40 } else { 100 };
            let eyes_open = !(i == 3 || i == 4);
            let now = t0 + Duration::from_millis(100 * i as u64);
            let out = h.analyzer.process(face_frame(x, y, eyes_open), now, morning(), &[]);
            if marked_at.is_none()
                && out
                    .events
                    .iter()
                    .any(|e| matches!(e, ResultEvent::AttendanceMarked { .. }))
            {
                marked_at = Some(i);
            }
            events.extend(out.events);
        }

        // Evidence is complete early, but the check lasts three seconds.
        assert_eq!(marked_at, Some(30));
        assert_eq!(
            events,
            vec![
                ResultEvent::LivenessVerified {
                    label: "Alice".into()
                },
                ResultEvent::AttendanceMarked {
                    name: "Alice".into(),
                    status: Status::Present,
                    time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                },
            ]
        );
        assert_eq!(h.analyzer.active_liveness_sessions(), 0);
    }

    #[test]
    fn test_still_face_times_out() {
        let config = PipelineConfig {
            require_liveness: true,
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        let t0 = Instant::now();

        let out = h.analyzer.process(face_frame(50, 50, true), t0, morning(), &[]);
        assert!(out.events.is_empty());
        let status = &out.display.faces[0].liveness.as_ref().unwrap().status;
        assert_eq!(status, "Liveness check: 0%");

        let out = h.analyzer.process(
            face_frame(50, 50, true),
            t0 + Duration::from_secs(16),
            morning(),
            &[],
        );
        assert_eq!(
            out.events,
            vec![ResultEvent::LivenessFailed {
                label: "Alice".into(),
                status: "Liveness check timed out".into(),
            }]
        );
        assert!(h.analyzer.ledger().today().is_empty());
    }

    #[test]
    fn test_liveness_skips_frames_between_passes() {
        let config = PipelineConfig {
            require_liveness: true,
            liveness_interval: 2,
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        let t0 = Instant::now();
        let blinks_after = |h: &mut Harness, i: u64, eyes_open: bool| {
            let now = t0 + Duration::from_millis(100 * i);
            let out = h.analyzer.process(face_frame(50, 50, eyes_open), now, morning(), &[]);
            out.display.faces[0].liveness.clone().unwrap()
        };

        // Closed eyes only on the odd frames, which liveness skips.
        for i in 0..6 {
            let report = blinks_after(&mut h, i, i % 2 == 0);
            assert_eq!(report.blinks, 0);
            assert_eq!(report.state, LivenessState::Collecting);
        }

        // Closed on two consecutive observed frames, open on the skipped one between.
        blinks_after(&mut h, 6, false);
        blinks_after(&mut h, 7, true);
        let report = blinks_after(&mut h, 8, false);
        assert_eq!(report.blinks, 1);
        assert_eq!(report.state, LivenessState::Collecting);
    }

    #[test]
    fn test_registration_storage_failure_names_label() {
        let mut h = harness(every_frame(Mode::Register), [0.0, 1.0, 0.0, 0.0]);
        let gallery = h._dir.path().join("gallery.json");
        std::fs::remove_file(&gallery).unwrap();
        std::fs::create_dir(&gallery).unwrap();

        let out = h
            .analyzer
            .process(face_frame(50, 50, true), Instant::now(), morning(), &["Carol".into()]);
        assert_eq!(out.events.len(), 2);
        assert!(matches!(out.events[0], ResultEvent::StorageFailed { .. }));
        match &out.events[1] {
            ResultEvent::RegistrationFailed {
                label,
                reason: RegistrationFailure::Storage(_),
            } => assert_eq!(label, "Carol"),
            other => panic!("unexpected event {other:?}"),
        }
        // Kept in memory for this session.
        assert_eq!(h.analyzer.matcher().store().count_for("Carol"), 1);
    }

    #[test]
    fn test_session_cancelled_when_face_leaves() {
        let config = PipelineConfig {
            require_liveness: true,
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        let t0 = Instant::now();
        h.analyzer.process(face_frame(50, 50, true), t0, morning(), &[]);
        assert_eq!(h.analyzer.active_liveness_sessions(), 1);

        let out = h
            .analyzer
            .process(empty_frame(), t0 + Duration::from_secs(2), morning(), &[]);
        assert!(out.events.is_empty());
        assert_eq!(h.analyzer.active_liveness_sessions(), 0);
    }

    #[test]
    fn test_emotion_smoothed_per_identity() {
        let backend = EmotionBackend::select(Some(Box::new(AlwaysHappy)), None);
        assert_eq!(backend.variant(), EmotionVariant::Primary);
        let mut h = harness_with(every_frame(Mode::Recognize), ALICE, backend);
        let out = h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        let emotion = out.display.faces[0].emotion.unwrap();
        assert_eq!(emotion.dominant(), Emotion::Happy);
        assert!(out.display.faces[0].caption().contains("happy"));
    }

    #[test]
    fn test_register_mode_boxes_only() {
        let mut h = harness(every_frame(Mode::Register), ALICE);
        let out = h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        assert_eq!(out.display.faces.len(), 1);
        assert!(out.display.faces[0].identity.is_none());
        assert_eq!(out.display.faces[0].caption(), "face");
    }

    #[test]
    fn test_registration_outcomes() {
        let mut h = harness(every_frame(Mode::Register), [0.0, 1.0, 0.0, 0.0]);
        let t0 = Instant::now();

        let out = h.analyzer.process(empty_frame(), t0, morning(), &["Carol".into()]);
        assert_eq!(
            out.events,
            vec![ResultEvent::RegistrationFailed {
                label: "Carol".into(),
                reason: RegistrationFailure::NoFace,
            }]
        );

        let out = h.analyzer.process(face_frame(50, 50, true), t0, morning(), &["Unknown".into()]);
        assert!(matches!(
            out.events[0],
            ResultEvent::RegistrationFailed {
                reason: RegistrationFailure::InvalidLabel(_),
                ..
            }
        ));

        let out = h.analyzer.process(face_frame(50, 50, true), t0, morning(), &[" Carol ".into()]);
        match &out.events[0] {
            ResultEvent::RegistrationSucceeded { label, quality, .. } => {
                assert_eq!(label, "Carol");
                assert!(*quality >= 0.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.analyzer.matcher().store().count_for("Carol"), 1);
    }

    #[test]
    fn test_registration_multiple_and_low_quality() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path().join("g.json"), 4).unwrap();
        let ledger = AttendanceLedger::open_for(dir.path().join("a.csv"), day()).unwrap();
        let two_faces = vec![
            FaceRegion::new(0.0, 100.0, 100.0, 0.0),
            FaceRegion::new(0.0, 300.0, 100.0, 200.0),
        ];
        let models = Models {
            detector: Box::new(FixedDetector(two_faces)),
            embedder: Box::new(FixedEmbedder(ALICE.to_vec())),
            emotion: EmotionBackend::select(None, None),
        };
        let mut analyzer = FrameAnalyzer::new(
            every_frame(Mode::Register),
            IdentityMatcher::new(store, 0.6),
            ledger,
            models,
        );
        let out = analyzer.process(empty_frame(), Instant::now(), morning(), &["Dan".into()]);
        assert_eq!(
            out.events[0],
            ResultEvent::RegistrationFailed {
                label: "Dan".into(),
                reason: RegistrationFailure::MultipleFaces(2),
            }
        );

        // Flat, dark, small face.
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path().join("g.json"), 4).unwrap();
        let ledger = AttendanceLedger::open_for(dir.path().join("a.csv"), day()).unwrap();
        let models = Models {
            detector: Box::new(FixedDetector(vec![FaceRegion::new(0.0, 40.0, 40.0, 0.0)])),
            embedder: Box::new(FixedEmbedder(ALICE.to_vec())),
            emotion: EmotionBackend::select(None, None),
        };
        let mut analyzer = FrameAnalyzer::new(
            every_frame(Mode::Register),
            IdentityMatcher::new(store, 0.6),
            ledger,
            models,
        );
        let dark = Frame::new(vec![10u8; FRAME_W * FRAME_H], FRAME_W as u32, FRAME_H as u32, 0);
        let out = analyzer.process(dark, Instant::now(), morning(), &["Dan".into()]);
        assert!(matches!(
            out.events[0],
            ResultEvent::RegistrationFailed {
                reason: RegistrationFailure::LowQuality(_),
                ..
            }
        ));
        assert!(analyzer.matcher().store().is_empty());
    }

    #[test]
    fn test_end_time_ends_session_once() {
        let config = PipelineConfig {
            end_time: NaiveTime::from_hms_opt(17, 0, 0),
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, STRANGER);
        let t0 = Instant::now();
        let before = day().and_hms_opt(16, 59, 59).unwrap();
        let after = day().and_hms_opt(17, 0, 0).unwrap();

        assert!(h.analyzer.process(empty_frame(), t0, before, &[]).events.is_empty());
        assert!(!h.analyzer.session_ended());
        assert_eq!(
            h.analyzer.process(empty_frame(), t0, after, &[]).events,
            vec![ResultEvent::SessionEnded]
        );
        assert!(h.analyzer.session_ended());
        assert!(h.analyzer.process(empty_frame(), t0, after, &[]).events.is_empty());
    }

    #[test]
    fn test_set_mode_cancels_sessions() {
        let config = PipelineConfig {
            require_liveness: true,
            ..every_frame(Mode::Attendance)
        };
        let mut h = harness(config, ALICE);
        h.analyzer.process(face_frame(50, 50, true), Instant::now(), morning(), &[]);
        assert_eq!(h.analyzer.active_liveness_sessions(), 1);
        h.analyzer.set_mode(Mode::Recognize);
        assert_eq!(h.analyzer.active_liveness_sessions(), 0);
        assert_eq!(h.analyzer.config().mode, Mode::Recognize);
    }

    struct LoopingSource {
        frame: Frame,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for LoopingSource {
        fn read_frame(&mut self) -> Result<Frame, CapabilityError> {
            Ok(self.frame.clone())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct DeadSource {
        released: Arc<AtomicBool>,
    }

    impl FrameSource for DeadSource {
        fn read_frame(&mut self) -> Result<Frame, CapabilityError> {
            Err(CapabilityError::Acquisition("device unplugged".into()))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn fast(mode: Mode) -> PipelineConfig {
        PipelineConfig {
            loop_sleep: Duration::from_millis(1),
            failure_backoff: Duration::from_millis(1),
            ..every_frame(mode)
        }
    }

    fn wait_for_event(
        pipeline: &CapturePipeline,
        pred: impl Fn(&ResultEvent) -> bool,
    ) -> Option<ResultEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(event) = pipeline.next_event() {
                if pred(&event) {
                    return Some(event);
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    #[test]
    fn test_pipeline_registers_and_returns_store() {
        let h = harness(fast(Mode::Register), [0.0, 0.0, 1.0, 0.0]);
        let released = Arc::new(AtomicBool::new(false));
        let source = LoopingSource {
            frame: face_frame(50, 50, true),
            released: Arc::clone(&released),
        };
        let pipeline = CapturePipeline::start(Box::new(source), h.analyzer).unwrap();
        assert!(pipeline.request_registration("Erin"));

        let event = wait_for_event(&pipeline, |e| {
            matches!(e, ResultEvent::RegistrationSucceeded { .. })
        });
        assert!(event.is_some(), "no registration event");
        assert!(pipeline.display.len() <= DISPLAY_QUEUE_CAPACITY);
        assert!(pipeline.next_display_frame().is_some());

        let (store, _ledger) = pipeline.join().unwrap();
        assert_eq!(store.count_for("Erin"), 1);
        assert!(released.load(Ordering::SeqCst));

        let reloaded = EmbeddingStore::open(store.path(), 4).unwrap();
        assert_eq!(reloaded.count_for("Erin"), 1);
    }

    #[test]
    fn test_camera_unavailable_reported_once() {
        let h = harness(fast(Mode::Recognize), ALICE);
        let released = Arc::new(AtomicBool::new(false));
        let source = DeadSource {
            released: Arc::clone(&released),
        };
        let pipeline = CapturePipeline::start(Box::new(source), h.analyzer).unwrap();

        let event = wait_for_event(&pipeline, |e| {
            matches!(e, ResultEvent::CameraUnavailable { .. })
        });
        assert_eq!(
            event,
            Some(ResultEvent::CameraUnavailable {
                consecutive_failures: 3
            })
        );

        std::thread::sleep(Duration::from_millis(50));
        assert!(pipeline.next_event().is_none());
        assert!(pipeline.next_display_frame().is_none());

        pipeline.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }
}
