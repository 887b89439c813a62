use clap::Parser;
use rollcall_core::{Config, ConfigLayer};
use std::path::PathBuf;

/// Command-line surface of the daemon. Every flag can also be set from a
/// `ROLLCALL_*` environment variable; anything left unset falls back to the
/// `--config` file and then to built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "rollcalld", version, about = "Face-recognition attendance daemon")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, env = "ROLLCALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Camera index (0) or V4L2 device path (/dev/video2)
    #[arg(long, env = "ROLLCALL_CAMERA")]
    pub camera: Option<String>,

    /// Directory of labeled reference images
    #[arg(long, env = "ROLLCALL_KNOWN_FACES")]
    pub known_faces: Option<PathBuf>,

    /// Attendance CSV file
    #[arg(long, env = "ROLLCALL_ATTENDANCE_FILE")]
    pub attendance_file: Option<PathBuf>,

    /// Directory containing the ONNX models
    #[arg(long, env = "ROLLCALL_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Maximum embedding distance accepted as a match
    #[arg(long, env = "ROLLCALL_TOLERANCE")]
    pub tolerance: Option<f32>,

    /// Detector upsampling (0-2)
    #[arg(long, env = "ROLLCALL_UPSAMPLE")]
    pub upsample: Option<u8>,

    /// Detector variant: fast or accurate
    #[arg(long, env = "ROLLCALL_MODEL")]
    pub model: Option<String>,

    /// Frame downscale factor before detection (0 < f <= 1)
    #[arg(long, env = "ROLLCALL_RESIZE")]
    pub resize: Option<f32>,

    /// Reference photos with several faces: reject or most-confident
    #[arg(long, env = "ROLLCALL_MULTI_FACE")]
    pub multi_face: Option<String>,

    /// Consecutive frame failures tolerated before giving up
    #[arg(long, env = "ROLLCALL_CAPTURE_RETRIES")]
    pub capture_retries: Option<u32>,

    /// Upper bound on one frame wait, in milliseconds
    #[arg(long, env = "ROLLCALL_CAPTURE_TIMEOUT_MS")]
    pub capture_timeout_ms: Option<u64>,

    /// Write the annotated frame to this image file
    #[arg(long = "preview", env = "ROLLCALL_PREVIEW")]
    pub preview_path: Option<PathBuf>,
}

impl Args {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            camera: self.camera.clone(),
            known_faces: self.known_faces.clone(),
            attendance_file: self.attendance_file.clone(),
            model_dir: self.model_dir.clone(),
            tolerance: self.tolerance,
            upsample: self.upsample,
            model: self.model.clone(),
            resize: self.resize,
            multi_face: self.multi_face.clone(),
            capture_retries: self.capture_retries,
            capture_timeout_ms: self.capture_timeout_ms,
            preview_path: self.preview_path.clone(),
        }
    }

    /// Merge flags over the config file and resolve defaults.
    pub fn load(&self) -> anyhow::Result<Config> {
        let file = match &self.config {
            Some(path) => ConfigLayer::from_file(path)?,
            None => ConfigLayer::default(),
        };
        Ok(Config::resolve(self.layer().or(file))?)
    }
}
