//! Live camera session: the consumer side of the capture pipeline.

use crate::config::Config;
use anyhow::{Context, Result};
use rollcall_core::pipeline::{CapturePipeline, DisplayFrame, FrameAnalyzer, Mode, Models, ResultEvent};
use rollcall_core::{AttendanceLedger, EmbeddingStore, EmotionBackend, IdentityMatcher};
use rollcall_hw::Camera;
use rollcall_models::{ArcFaceEmbedder, UltraFaceDetector};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Consumer poll period (~30 Hz).
const POLL_INTERVAL: Duration = Duration::from_millis(33);

pub fn load_models(config: &Config, with_emotion: bool) -> Result<Models> {
    let detector = UltraFaceDetector::load(&config.detector_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.embedder_model_path())?;
    let emotion = if with_emotion {
        rollcall_models::load_emotion_backend(
            &config.emotion_primary_path(),
            &config.emotion_fallback_path(),
        )
    } else {
        EmotionBackend::select(None, None)
    };
    Ok(Models {
        detector: Box::new(detector),
        embedder: Box::new(embedder),
        emotion,
    })
}

pub async fn run(config: &Config, mode: Mode) -> Result<()> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    let models = load_models(config, config.emotion_enabled && mode != Mode::Register)?;
    let store = EmbeddingStore::open(&config.gallery_path, config.embedding_dim)?;
    let ledger = AttendanceLedger::open(&config.attendance_path)?;
    tracing::info!(
        mode = %mode,
        enrolled = store.len(),
        threshold = config.match_threshold,
        liveness = config.require_liveness,
        "starting live session"
    );

    let analyzer = FrameAnalyzer::new(
        config.pipeline_config(mode),
        IdentityMatcher::new(store, config.match_threshold),
        ledger,
        models,
    );
    let pipeline = CapturePipeline::start(Box::new(camera), analyzer)?;

    if mode == Mode::Register {
        println!("Type a name and press Enter to register the face in view. Ctrl-C to quit.");
    }
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = mode == Mode::Register;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    let mut last_caption = String::new();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(label) if !label.trim().is_empty() => {
                    pipeline.request_registration(label.trim());
                }
                Some(_) => {}
                None => stdin_open = false,
            },
            _ = tick.tick() => {
                while let Some(event) = pipeline.next_event() {
                    report_event(&event);
                }
                if let Some(frame) = latest_frame(&pipeline) {
                    let caption = describe(&frame);
                    if caption != last_caption {
                        tracing::info!(faces = %caption, "view changed");
                        last_caption = caption;
                    }
                }
                if !pipeline.is_running() {
                    break;
                }
            }
        }
    }

    pipeline.stop();
    while let Some(event) = pipeline.next_event() {
        report_event(&event);
    }
    let (store, ledger) = tokio::task::spawn_blocking(move || pipeline.join())
        .await
        .context("capture thread join task")??;

    let present = ledger.today();
    println!(
        "Session closed: {} enrolled, {} marked today{}",
        store.len(),
        present.len(),
        if present.is_empty() {
            String::new()
        } else {
            format!(" ({})", present.join(", "))
        }
    );
    Ok(())
}

/// Drain the display queue, keeping only the newest frame.
fn latest_frame(pipeline: &CapturePipeline) -> Option<DisplayFrame> {
    std::iter::from_fn(|| pipeline.next_display_frame()).last()
}

fn describe(frame: &DisplayFrame) -> String {
    if frame.faces.is_empty() {
        return "none".to_string();
    }
    frame
        .faces
        .iter()
        .map(|f| f.caption())
        .collect::<Vec<_>>()
        .join("; ")
}

fn report_event(event: &ResultEvent) {
    match event {
        ResultEvent::CameraUnavailable { .. } | ResultEvent::StorageFailed { .. } => {
            tracing::error!(event = %event, "pipeline problem");
            eprintln!("{event}");
        }
        _ => println!("{event}"),
    }
}
