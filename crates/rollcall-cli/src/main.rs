use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{
    AttendanceRecord, BoundingBox, BuildReport, Config, ConfigLayer, CsvStore, FaceExtractor,
    Gallery, GalleryBuilder, Identity, Ledger, Matcher, NearestNeighborMatcher, OnnxExtractor,
    Tolerance,
};
use rollcall_hw::Camera;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall attendance CLI")]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared with the daemon; unset values come from `--config`, then defaults.
#[derive(Args)]
struct Options {
    /// TOML configuration file
    #[arg(long, global = true, env = "ROLLCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of labeled reference images
    #[arg(long, global = true, env = "ROLLCALL_KNOWN_FACES")]
    known_faces: Option<PathBuf>,

    /// Attendance CSV file
    #[arg(long, global = true, env = "ROLLCALL_ATTENDANCE_FILE")]
    attendance_file: Option<PathBuf>,

    /// Directory containing the ONNX models
    #[arg(long, global = true, env = "ROLLCALL_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Maximum embedding distance accepted as a match
    #[arg(long, global = true, env = "ROLLCALL_TOLERANCE")]
    tolerance: Option<f32>,

    /// Detector upsampling (0-2)
    #[arg(long, global = true, env = "ROLLCALL_UPSAMPLE")]
    upsample: Option<u8>,

    /// Detector variant: fast or accurate
    #[arg(long, global = true, env = "ROLLCALL_MODEL")]
    model: Option<String>,

    /// Reference photos with several faces: reject or most-confident
    #[arg(long, global = true, env = "ROLLCALL_MULTI_FACE")]
    multi_face: Option<String>,
}

impl Options {
    fn load(&self) -> Result<Config> {
        let file = match &self.config {
            Some(path) => ConfigLayer::from_file(path)?,
            None => ConfigLayer::default(),
        };
        let flags = ConfigLayer {
            known_faces: self.known_faces.clone(),
            attendance_file: self.attendance_file.clone(),
            model_dir: self.model_dir.clone(),
            tolerance: self.tolerance,
            upsample: self.upsample,
            model: self.model.clone(),
            multi_face: self.multi_face.clone(),
            ..ConfigLayer::default()
        };
        Config::resolve(flags.or(file)).context("invalid configuration")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the gallery and list labels with their reference counts
    Gallery,
    /// Identify every face in an image file
    Identify {
        /// Image to identify
        image: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show attendance for one day
    Report {
        /// Day to report, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Serialize)]
struct FaceReport {
    identity: Identity,
    distance: f32,
    bbox: BoundingBox,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gallery => {
            let config = cli.options.load()?;
            let (gallery, report, _) = build_gallery(&config)?;
            println!(
                "{} reference images, {} loaded, {} skipped",
                report.images,
                report.loaded,
                report.skipped.len()
            );
            for (label, count) in gallery.labels() {
                println!("  {label:<24} {count}");
            }
            for skipped in &report.skipped {
                println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
            }
        }
        Commands::Identify { image, json } => {
            let config = cli.options.load()?;
            let (gallery, _, mut extractor) = build_gallery(&config)?;
            let faces = identify(&mut extractor, &gallery, config.tolerance, &image)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&faces)?);
            } else if faces.is_empty() {
                println!("no faces found in {}", image.display());
            } else {
                for face in &faces {
                    println!("{}", face_line(face));
                }
            }
        }
        Commands::Report { date, json } => {
            let config = cli.options.load()?;
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let records = day_records(&config.attendance_file, date)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance recorded on {date}");
            } else {
                println!("Attendance on {date}:");
                for r in &records {
                    println!("{}", record_line(r));
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

fn build_gallery(config: &Config) -> Result<(Gallery, BuildReport, OnnxExtractor)> {
    let extractor = OnnxExtractor::load(&config.model_dir, config.model, config.upsample)
        .context("failed to load models")?;
    let mut builder = GalleryBuilder::new(extractor, config.multi_face);
    let (gallery, report) = builder
        .build(&config.known_faces)
        .with_context(|| format!("failed to build gallery from {}", config.known_faces.display()))?;
    Ok((gallery, report, builder.into_extractor()))
}

fn identify<E: FaceExtractor>(
    extractor: &mut E,
    gallery: &Gallery,
    tolerance: Tolerance,
    path: &Path,
) -> Result<Vec<FaceReport>> {
    let image = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    let detections = extractor
        .extract(&image)
        .with_context(|| format!("face extraction failed for {}", path.display()))?;
    tracing::debug!(path = %path.display(), faces = detections.len(), "faces extracted");

    let matcher = NearestNeighborMatcher;
    Ok(detections
        .into_iter()
        .map(|d| {
            let result = matcher.compare(&d.embedding, gallery, tolerance);
            FaceReport {
                identity: result.identity,
                distance: result.distance,
                bbox: d.bbox,
            }
        })
        .collect())
}

fn face_line(face: &FaceReport) -> String {
    format!(
        "{:<24} distance {:.3}  at ({:.0}, {:.0}) {:.0}x{:.0}",
        face.identity.to_string(),
        face.distance,
        face.bbox.x,
        face.bbox.y,
        face.bbox.width,
        face.bbox.height
    )
}

/// Attendance for one day from the persisted table, ordered by identity.
fn day_records(path: &Path, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
    let ledger = Ledger::open(CsvStore::new(path))
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ledger.records_on(date).cloned().collect())
}

fn record_line(r: &AttendanceRecord) -> String {
    format!(
        "  {:<24} {}  {}",
        r.identity,
        r.first_seen.format("%H:%M:%S"),
        r.last_seen.format("%H:%M:%S")
    )
}
