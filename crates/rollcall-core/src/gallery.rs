//! Gallery construction from a directory of labeled reference photos.
//!
//! Layout contract: an image directly under the root is labeled by its file
//! stem (`root/alice.jpg → alice`); an image inside a subdirectory is
//! labeled by the directory that directly contains it (`root/bob/1.jpg → bob`,
//! `root/staff/carol/2.jpg → carol`). The directory name takes precedence
//! over the file name.

use crate::config::ConfigError;
use crate::extractor::FaceExtractor;
use crate::types::{Detection, Embedding};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use walkdir::WalkDir;

/// Reference image extensions, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery directory not found: {0}")]
    RootNotFound(PathBuf),
    #[error("gallery path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("no usable reference images in {root} ({skipped} skipped)")]
    NoUsableImages { root: PathBuf, skipped: usize },
    #[error("embedding model mismatch for {label}: expected {expected:?}, got {actual:?}")]
    ModelMismatch {
        label: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("embedding dimension mismatch for {label}: expected {expected}, got {actual}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
}

/// One reference embedding. A label owns one entry per usable photo.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
    /// Image the embedding was extracted from.
    pub source: PathBuf,
}

/// Immutable, ordered set of reference embeddings.
///
/// Entry order is insertion order and is what breaks matcher ties. Nothing
/// mutates a gallery after construction, so `&Gallery` can be shared freely.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Build a gallery from entries, requiring a single embedding model and
    /// dimension.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        if let Some(first) = entries.first() {
            let model = &first.embedding.model_version;
            if let Some(bad) = entries.iter().find(|e| e.embedding.model_version != *model) {
                return Err(GalleryError::ModelMismatch {
                    label: bad.label.clone(),
                    expected: model.clone(),
                    actual: bad.embedding.model_version.clone(),
                });
            }

            let expected = first.embedding.dimension();
            if let Some(bad) = entries
                .iter()
                .find(|e| e.embedding.dimension() != expected)
            {
                return Err(GalleryError::DimensionMismatch {
                    label: bad.label.clone(),
                    expected,
                    actual: bad.embedding.dimension(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    /// Distinct labels in first-insertion order, with their reference counts.
    pub fn labels(&self) -> Vec<(&str, usize)> {
        let mut labels: Vec<(&str, usize)> = Vec::new();
        for entry in &self.entries {
            match labels.iter_mut().find(|(l, _)| *l == entry.label) {
                Some((_, count)) => *count += 1,
                None => labels.push((&entry.label, 1)),
            }
        }
        labels
    }
}

/// What to do with a reference photo that contains more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    /// Exclude the photo; it is ambiguous which face the label names.
    #[default]
    Reject,
    /// Use the detection with the highest confidence.
    MostConfident,
}

impl FromStr for MultiFacePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "most-confident" | "most_confident" => Ok(Self::MostConfident),
            _ => Err(ConfigError::MultiFacePolicy(s.to_string())),
        }
    }
}

impl fmt::Display for MultiFacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::MostConfident => f.write_str("most-confident"),
        }
    }
}

/// Why a reference image was left out of the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Unreadable(String),
    NoFace,
    MultipleFaces(usize),
    Extractor(String),
    DimensionMismatch { expected: usize, actual: usize },
    NoLabel,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable(e) => write!(f, "unreadable image: {e}"),
            Self::NoFace => f.write_str("no face found"),
            Self::MultipleFaces(n) => write!(f, "{n} faces found"),
            Self::Extractor(e) => write!(f, "extractor failed: {e}"),
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "embedding dimension {actual}, gallery uses {expected}")
            }
            Self::NoLabel => f.write_str("cannot derive a label from the path"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of a gallery build, for operator feedback.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Image files found under the root.
    pub images: usize,
    /// Images that contributed an entry.
    pub loaded: usize,
    pub skipped: Vec<SkippedImage>,
}

/// Derive the label for `image` under `root`.
///
/// Returns `None` if the image is not under the root or has no usable name.
pub fn derive_label(root: &Path, image: &Path) -> Option<String> {
    let rel = image.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    let label = match parts.as_slice() {
        [] => return None,
        [_file] => rel.file_stem()?.to_str()?,
        [.., dir, _file] => *dir,
    };

    let label = label.trim();
    (!label.is_empty()).then(|| label.to_string())
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// List reference images under `root`, in file-name order at every level.
pub fn list_images(root: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    if !root.exists() {
        return Err(GalleryError::RootNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(GalleryError::NotADirectory(root.to_path_buf()));
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable gallery entry");
                continue;
            }
        };
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Builds a [`Gallery`] by running an extractor over every reference photo.
pub struct GalleryBuilder<E> {
    extractor: E,
    policy: MultiFacePolicy,
}

impl<E: FaceExtractor> GalleryBuilder<E> {
    pub fn new(extractor: E, policy: MultiFacePolicy) -> Self {
        Self { extractor, policy }
    }

    /// Give back the extractor, e.g. to reuse it in the capture loop.
    pub fn into_extractor(self) -> E {
        self.extractor
    }

    /// Walk `root` and build the gallery.
    ///
    /// Images that cannot be used are skipped with a warning. Fails only
    /// when the root is missing or yields no usable image at all.
    pub fn build(&mut self, root: &Path) -> Result<(Gallery, BuildReport), GalleryError> {
        let images = list_images(root)?;
        let mut report = BuildReport {
            images: images.len(),
            ..Default::default()
        };
        let mut entries: Vec<GalleryEntry> = Vec::new();

        for path in images {
            match self.load_entry(root, &path, entries.first()) {
                Ok(entry) => {
                    tracing::info!(label = %entry.label, path = %path.display(), "loaded reference face");
                    entries.push(entry);
                    report.loaded += 1;
                }
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "skipping reference image");
                    report.skipped.push(SkippedImage { path, reason });
                }
            }
        }

        if entries.is_empty() {
            return Err(GalleryError::NoUsableImages {
                root: root.to_path_buf(),
                skipped: report.skipped.len(),
            });
        }

        let gallery = Gallery::from_entries(entries)?;
        tracing::info!(
            images = report.images,
            loaded = report.loaded,
            labels = gallery.labels().len(),
            skipped = report.skipped.len(),
            "gallery built"
        );
        Ok((gallery, report))
    }

    fn load_entry(
        &mut self,
        root: &Path,
        path: &Path,
        first: Option<&GalleryEntry>,
    ) -> Result<GalleryEntry, SkipReason> {
        let label = derive_label(root, path).ok_or(SkipReason::NoLabel)?;
        let image = image::open(path)
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?
            .to_rgb8();
        let detections = self
            .extractor
            .extract(&image)
            .map_err(|e| SkipReason::Extractor(e.to_string()))?;
        let detection = self.select_face(detections)?;

        if let Some(first) = first {
            let expected = first.embedding.dimension();
            let actual = detection.embedding.dimension();
            if expected != actual {
                return Err(SkipReason::DimensionMismatch { expected, actual });
            }
        }

        Ok(GalleryEntry {
            label,
            embedding: detection.embedding,
            source: path.to_path_buf(),
        })
    }

    fn select_face(&self, detections: Vec<Detection>) -> Result<Detection, SkipReason> {
        let count = detections.len();
        match (count, self.policy) {
            (0, _) => Err(SkipReason::NoFace),
            (1, _) | (_, MultiFacePolicy::MostConfident) => detections
                .into_iter()
                .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
                .ok_or(SkipReason::NoFace),
            (n, MultiFacePolicy::Reject) => Err(SkipReason::MultipleFaces(n)),
        }
    }
}
