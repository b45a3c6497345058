use anyhow::{Context, Result};
use chrono::NaiveTime;
use rollcall_core::attendance::parse_clock;
use rollcall_core::pipeline::{Mode, PipelineConfig};
use rollcall_core::LivenessConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Optional TOML file named by `ROLLCALL_CONFIG`. Environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    attendance_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    embedding_dim: Option<usize>,
    analysis_interval: Option<u32>,
    liveness_interval: Option<u32>,
    require_liveness: Option<bool>,
    liveness_duration_secs: Option<f32>,
    liveness_timeout_secs: Option<f32>,
    ear_threshold: Option<f32>,
    blink_frames: Option<u32>,
    movement_threshold: Option<f32>,
    emotion_enabled: Option<bool>,
    smoothing_window: Option<usize>,
    late_time: Option<String>,
    end_time: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Runtime configuration: defaults, then the TOML file, then `ROLLCALL_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    pub gallery_path: PathBuf,
    pub attendance_path: PathBuf,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    pub embedding_dim: usize,
    pub analysis_interval: u32,
    pub liveness_interval: u32,
    pub require_liveness: bool,
    pub liveness: LivenessConfig,
    pub emotion_enabled: bool,
    pub smoothing_window: usize,
    pub late_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, &|key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(env));
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));
        let gallery_path = env("ROLLCALL_GALLERY_PATH")
            .map(PathBuf::from)
            .or(file.gallery_path)
            .unwrap_or_else(|| data_dir.join("gallery.json"));
        let attendance_path = env("ROLLCALL_ATTENDANCE_PATH")
            .map(PathBuf::from)
            .or(file.attendance_path)
            .unwrap_or_else(|| data_dir.join("attendance.csv"));

        let defaults = LivenessConfig::default();
        let liveness = LivenessConfig {
            check_duration: seconds(
                env,
                "ROLLCALL_LIVENESS_DURATION_SECS",
                file.liveness_duration_secs,
                defaults.check_duration,
            )?,
            timeout: seconds(
                env,
                "ROLLCALL_LIVENESS_TIMEOUT_SECS",
                file.liveness_timeout_secs,
                defaults.timeout,
            )?,
            ear_threshold: pick(env, "ROLLCALL_EAR_THRESHOLD", file.ear_threshold, defaults.ear_threshold),
            blink_frames: pick(env, "ROLLCALL_BLINK_FRAMES", file.blink_frames, defaults.blink_frames),
            movement_threshold: pick(
                env,
                "ROLLCALL_MOVEMENT_THRESHOLD",
                file.movement_threshold,
                defaults.movement_threshold,
            ),
            ..defaults
        };

        let late_time = clock(env, "ROLLCALL_LATE_TIME", file.late_time)?;
        let end_time = clock(env, "ROLLCALL_END_TIME", file.end_time)?;

        Ok(Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: pick(env, "ROLLCALL_CAMERA_WIDTH", file.camera_width, 640),
            camera_height: pick(env, "ROLLCALL_CAMERA_HEIGHT", file.camera_height, 480),
            model_dir,
            data_dir,
            gallery_path,
            attendance_path,
            match_threshold: pick(env, "ROLLCALL_MATCH_THRESHOLD", file.match_threshold, 1.0),
            embedding_dim: pick(
                env,
                "ROLLCALL_EMBEDDING_DIM",
                file.embedding_dim,
                rollcall_models::ARCFACE_EMBEDDING_DIM,
            ),
            analysis_interval: pick(env, "ROLLCALL_ANALYSIS_INTERVAL", file.analysis_interval, 4),
            liveness_interval: pick(env, "ROLLCALL_LIVENESS_INTERVAL", file.liveness_interval, 1),
            require_liveness: pick_flag(env, "ROLLCALL_REQUIRE_LIVENESS", file.require_liveness, true),
            liveness,
            emotion_enabled: pick_flag(env, "ROLLCALL_EMOTION_ENABLED", file.emotion_enabled, true),
            smoothing_window: pick(env, "ROLLCALL_SMOOTHING_WINDOW", file.smoothing_window, 5),
            late_time,
            end_time,
        })
    }

    pub fn pipeline_config(&self, mode: Mode) -> PipelineConfig {
        PipelineConfig {
            mode,
            analysis_interval: self.analysis_interval,
            liveness_interval: self.liveness_interval,
            require_liveness: self.require_liveness,
            liveness: self.liveness.clone(),
            emotion_enabled: self.emotion_enabled,
            smoothing_window: self.smoothing_window,
            late_cutoff: self.late_time,
            end_time: self.end_time,
            ..PipelineConfig::default()
        }
    }

    /// UltraFace RFB-320 detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path("version-RFB-320.onnx")
    }

    /// ArcFace recognition model.
    pub fn embedder_model_path(&self) -> String {
        self.model_path("w600k_r50.onnx")
    }

    pub fn emotion_primary_path(&self) -> String {
        self.model_path("emotion-ferplus-8.onnx")
    }

    pub fn emotion_fallback_path(&self) -> String {
        self.model_path("emotion-fer2013.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn default_data_dir(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Env var if it parses, else the file value, else `default`.
fn pick<T: FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    file: Option<T>,
    default: T,
) -> T {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .or(file)
        .unwrap_or(default)
}

/// Boolean switch: "0", "false" and "no" turn it off.
fn pick_flag(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    file: Option<bool>,
    default: bool,
) -> bool {
    env(key)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
        .or(file)
        .unwrap_or(default)
}

/// Seconds value as a `Duration`; negative or non-finite values are an error.
fn seconds(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    file: Option<f32>,
    default: Duration,
) -> Result<Duration> {
    let secs = pick(env, key, file, default.as_secs_f32());
    Duration::try_from_secs_f32(secs)
        .with_context(|| format!("{key}: expected non-negative seconds, got {secs}"))
}

fn clock(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    file: Option<String>,
) -> Result<Option<NaiveTime>> {
    match env(key).or(file).filter(|v| !v.trim().is_empty()) {
        Some(raw) => parse_clock(&raw)
            .map(Some)
            .with_context(|| format!("{key}: expected HH:MM, got {raw:?}")),
        None => Ok(None),
    }
}
