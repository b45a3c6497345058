use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::attendance::parse_clock;
use rollcall_core::pipeline::Mode;
use rollcall_core::{AttendanceLedger, EmbeddingStore, IdentityMatcher};
use std::path::PathBuf;

mod config;
mod enroll;
mod live;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live camera session
    Run {
        #[arg(long, value_enum, default_value_t = ModeArg::Attendance)]
        mode: ModeArg,
        /// V4L2 device (overrides ROLLCALL_CAMERA_DEVICE)
        #[arg(long)]
        device: Option<String>,
        /// Arrivals after this time (HH:MM) are marked late
        #[arg(long)]
        late_time: Option<String>,
        /// Stop the attendance session at this time (HH:MM)
        #[arg(long)]
        end_time: Option<String>,
        /// Mark attendance without the blink/motion check
        #[arg(long)]
        no_liveness: bool,
        #[arg(long)]
        no_emotion: bool,
        /// Match distance threshold
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Register a face from an image file
    Enroll {
        #[arg(short, long)]
        label: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Register every image under DIR/<person>/
    EnrollDir { dir: PathBuf },
    /// Identify the faces in an image file
    Recognize {
        image: PathBuf,
        /// Save a copy with the faces boxed
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove all embeddings of a person
    Remove { label: String },
    /// List registered persons
    List,
    /// Show attendance records for a day (default: today)
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Gallery statistics and today's attendance summary
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Recognize,
    Attendance,
    Register,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Recognize => Mode::Recognize,
            ModeArg::Attendance => Mode::Attendance,
            ModeArg::Register => Mode::Register,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Run {
            mode,
            device,
            late_time,
            end_time,
            no_liveness,
            no_emotion,
            threshold,
        } => {
            if let Some(device) = device {
                config.camera_device = device;
            }
            if let Some(raw) = late_time {
                config.late_time = Some(clock_arg("--late-time", &raw)?);
            }
            if let Some(raw) = end_time {
                config.end_time = Some(clock_arg("--end-time", &raw)?);
            }
            if no_liveness {
                config.require_liveness = false;
            }
            if no_emotion {
                config.emotion_enabled = false;
            }
            if let Some(threshold) = threshold {
                config.match_threshold = threshold;
            }
            live::run(&config, mode.into()).await?;
        }
        Commands::Enroll { label, image } => {
            let mut models = live::load_models(&config, false)?;
            let mut matcher = open_matcher(&config)?;
            let enrolled = enroll::enroll_image(
                models.detector.as_mut(),
                models.embedder.as_mut(),
                &mut matcher,
                &image,
                &label,
            )?;
            println!(
                "Registered {} (quality {:.2}, id {})",
                enrolled.label, enrolled.quality.overall, enrolled.id
            );
        }
        Commands::EnrollDir { dir } => {
            let mut models = live::load_models(&config, false)?;
            let mut matcher = open_matcher(&config)?;
            let stats = enroll::enroll_folder(
                models.detector.as_mut(),
                models.embedder.as_mut(),
                &mut matcher,
                &dir,
            )?;
            println!("Images processed:   {}", stats.total_images);
            println!("Successful:         {}", stats.successful);
            println!("Failed:             {}", stats.failed);
            println!("Persons registered: {}", stats.persons_registered);
        }
        Commands::Recognize { image, output } => {
            let mut models = live::load_models(&config, false)?;
            let matcher = open_matcher(&config)?;
            let (frame, faces) = enroll::recognize_image(
                models.detector.as_mut(),
                models.embedder.as_mut(),
                &matcher,
                &image,
            )?;
            if faces.is_empty() {
                println!("No faces found in {}", image.display());
            }
            for face in &faces {
                let r = &face.region;
                match &face.identity {
                    Some(m) => println!(
                        "{}\t{:.3}\t({:.0}, {:.0}, {:.0}, {:.0})",
                        m.name(),
                        m.distance,
                        r.top,
                        r.right,
                        r.bottom,
                        r.left
                    ),
                    None => println!("{}\t-", face.name()),
                }
            }
            if let Some(output) = output {
                enroll::save_annotated(frame, &faces, &output)?;
                println!("Annotated image written to {}", output.display());
            }
        }
        Commands::Remove { label } => {
            let mut store = EmbeddingStore::open(&config.gallery_path, config.embedding_dim)?;
            match store.remove(&label)? {
                0 => println!("No embeddings found for {label}"),
                n => println!("Removed {n} embedding(s) for {label}"),
            }
        }
        Commands::List => {
            let store = EmbeddingStore::open(&config.gallery_path, config.embedding_dim)?;
            let labels = store.labels();
            if labels.is_empty() {
                println!("No persons registered");
            }
            for label in labels {
                println!("{label}\t{} embedding(s)", store.count_for(label));
            }
        }
        Commands::Report { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let ledger = AttendanceLedger::open(&config.attendance_path)?;
            let records = ledger.report(date)?;
            if records.is_empty() {
                println!("No attendance recorded on {date}");
            }
            for r in &records {
                println!("{}\t{}\t{}", r.name, r.time.format("%H:%M:%S"), r.status);
            }
        }
        Commands::Status => {
            let store = EmbeddingStore::open(&config.gallery_path, config.embedding_dim)?;
            let stats = store.stats();
            println!("Gallery:    {}", stats.path.display());
            println!("Persons:    {}", stats.unique_persons);
            println!("Embeddings: {} x {}", stats.total_embeddings, stats.dimension);
            if let Some(saved_at) = stats.saved_at {
                println!("Saved at:   {}", saved_at.to_rfc3339());
            }

            let ledger = AttendanceLedger::open(&config.attendance_path)?;
            let summary = ledger.summary(ledger.current_date())?;
            println!(
                "Today ({}): {} marked, {} present, {} late",
                summary.date, summary.total, summary.present, summary.late
            );
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

fn open_matcher(config: &Config) -> Result<IdentityMatcher> {
    let store = EmbeddingStore::open(&config.gallery_path, config.embedding_dim)?;
    Ok(IdentityMatcher::new(store, config.match_threshold))
}

fn clock_arg(flag: &str, raw: &str) -> Result<chrono::NaiveTime> {
    match parse_clock(raw) {
        Some(t) => Ok(t),
        None => bail!("{flag}: expected HH:MM, got {raw:?}"),
    }
}
