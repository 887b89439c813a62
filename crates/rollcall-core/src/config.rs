//! Configuration values and layered resolution.
//!
//! Every tunable has a validated newtype. A [`ConfigLayer`] holds the
//! optional values from one source (command line, environment, TOML file);
//! layers are merged highest-first and resolved into a [`Config`] that the
//! capture loop can trust without re-checking ranges.

use crate::gallery::MultiFacePolicy;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CAMERA: &str = "0";
pub const DEFAULT_KNOWN_FACES: &str = "known_faces";
pub const DEFAULT_ATTENDANCE_FILE: &str = "attendance.csv";
/// ArcFace embeddings are unit length; 1.0 corresponds to a cosine similarity of 0.5.
pub const DEFAULT_TOLERANCE: f32 = 1.0;
pub const DEFAULT_UPSAMPLE: u8 = 1;
pub const DEFAULT_RESIZE: f32 = 0.25;
pub const DEFAULT_CAPTURE_RETRIES: u32 = 5;
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 2000;

const MAX_TOLERANCE: f32 = 2.0;
const MAX_UPSAMPLE: u8 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("tolerance must be in (0, {MAX_TOLERANCE}], got {0}")]
    Tolerance(f32),
    #[error("resize factor must be in (0, 1], got {0}")]
    Resize(f32),
    #[error("upsample factor must be in [0, {MAX_UPSAMPLE}], got {0}")]
    Upsample(u8),
    #[error("capture timeout must be greater than zero")]
    CaptureTimeout,
    #[error("unknown detector model {0:?} (expected fast, accurate, hog or cnn)")]
    DetectorModel(String),
    #[error("unknown multi-face policy {0:?} (expected reject or most-confident)")]
    MultiFacePolicy(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Maximum embedding distance at which a match is accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance(f32);

impl Tolerance {
    pub fn new(value: f32) -> Result<Self, ConfigError> {
        if value.is_finite() && value > 0.0 && value <= MAX_TOLERANCE {
            Ok(Self(value))
        } else {
            Err(ConfigError::Tolerance(value))
        }
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

/// Frame downscale factor applied before detection, `0 < f <= 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownscaleFactor(f32);

impl DownscaleFactor {
    pub fn new(value: f32) -> Result<Self, ConfigError> {
        if value.is_finite() && value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ConfigError::Resize(value))
        }
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

/// Detection upsample factor. Each step doubles the detector input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsampleFactor(u8);

impl UpsampleFactor {
    pub fn new(value: u8) -> Result<Self, ConfigError> {
        if value <= MAX_UPSAMPLE {
            Ok(Self(value))
        } else {
            Err(ConfigError::Upsample(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Detector capability flag passed to the embedding extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorModel {
    /// Small detector, suited to CPU-only machines.
    #[default]
    Fast,
    /// Large detector; slower, better recall on small or turned faces.
    Accurate,
}

impl FromStr for DetectorModel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(Self::Fast),
            "accurate" | "cnn" => Ok(Self::Accurate),
            _ => Err(ConfigError::DetectorModel(s.to_string())),
        }
    }
}

impl fmt::Display for DetectorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Accurate => f.write_str("accurate"),
        }
    }
}

/// Optional settings from a single source.
///
/// Doubles as the TOML file schema; command-line values are collected into
/// the same shape so every source merges the same way.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub camera: Option<String>,
    pub known_faces: Option<PathBuf>,
    pub attendance_file: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub tolerance: Option<f32>,
    pub upsample: Option<u8>,
    pub model: Option<String>,
    pub resize: Option<f32>,
    pub multi_face: Option<String>,
    pub capture_retries: Option<u32>,
    pub capture_timeout_ms: Option<u64>,
    pub preview_path: Option<PathBuf>,
}

impl ConfigLayer {
    /// Load a layer from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fill every unset value in `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            camera: self.camera.or(lower.camera),
            known_faces: self.known_faces.or(lower.known_faces),
            attendance_file: self.attendance_file.or(lower.attendance_file),
            model_dir: self.model_dir.or(lower.model_dir),
            tolerance: self.tolerance.or(lower.tolerance),
            upsample: self.upsample.or(lower.upsample),
            model: self.model.or(lower.model),
            resize: self.resize.or(lower.resize),
            multi_face: self.multi_face.or(lower.multi_face),
            capture_retries: self.capture_retries.or(lower.capture_retries),
            capture_timeout_ms: self.capture_timeout_ms.or(lower.capture_timeout_ms),
            preview_path: self.preview_path.or(lower.preview_path),
        }
    }
}

/// Fully resolved and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera index (`0`) or device path (`/dev/video2`).
    pub camera: String,
    /// Directory of labeled reference images.
    pub known_faces: PathBuf,
    /// Attendance CSV file.
    pub attendance_file: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub tolerance: Tolerance,
    pub upsample: UpsampleFactor,
    pub model: DetectorModel,
    pub resize: DownscaleFactor,
    pub multi_face: MultiFacePolicy,
    /// Consecutive frame-acquisition failures tolerated before giving up.
    pub capture_retries: u32,
    /// Upper bound on a single blocking frame wait.
    pub capture_timeout: Duration,
    /// Where to write the annotated preview frame, if anywhere.
    pub preview_path: Option<PathBuf>,
}

impl Config {
    /// Apply defaults to a merged layer and validate every value.
    pub fn resolve(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let timeout_ms = layer
            .capture_timeout_ms
            .unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::CaptureTimeout);
        }

        Ok(Self {
            camera: layer.camera.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
            known_faces: layer
                .known_faces
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_FACES)),
            attendance_file: layer
                .attendance_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ATTENDANCE_FILE)),
            model_dir: layer.model_dir.unwrap_or_else(default_model_dir),
            tolerance: Tolerance::new(layer.tolerance.unwrap_or(DEFAULT_TOLERANCE))?,
            upsample: UpsampleFactor::new(layer.upsample.unwrap_or(DEFAULT_UPSAMPLE))?,
            model: layer
                .model
                .as_deref()
                .map(str::parse::<DetectorModel>)
                .transpose()?
                .unwrap_or_default(),
            resize: DownscaleFactor::new(layer.resize.unwrap_or(DEFAULT_RESIZE))?,
            multi_face: layer
                .multi_face
                .as_deref()
                .map(str::parse::<MultiFacePolicy>)
                .transpose()?
                .unwrap_or_default(),
            capture_retries: layer.capture_retries.unwrap_or(DEFAULT_CAPTURE_RETRIES),
            capture_timeout: Duration::from_millis(timeout_ms),
            preview_path: layer.preview_path,
        })
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
