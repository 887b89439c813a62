//! Embedding extraction: the seam between image frames and face embeddings.
//!
//! [`FaceExtractor`] is the capability the gallery builder and the capture
//! loop consume. [`OnnxExtractor`] is the production implementation, pairing
//! the SCRFD detector with the ArcFace recognizer.

use crate::config::{DetectorModel, UpsampleFactor};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Maps an image to zero or more detected faces with their embeddings.
///
/// Implementations return detections sorted by confidence, highest first.
pub trait FaceExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError>;
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for &mut E {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
        (**self).extract(image)
    }
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for Box<E> {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
        (**self).extract(image)
    }
}

/// SCRFD detection model file for a detector variant.
pub fn detector_model_file(model: DetectorModel) -> &'static str {
    match model {
        DetectorModel::Fast => "det_500m.onnx",
        DetectorModel::Accurate => "det_10g.onnx",
    }
}

/// SCRFD + ArcFace extractor running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(
        model_dir: &Path,
        model: DetectorModel,
        upsample: UpsampleFactor,
    ) -> Result<Self, ExtractorError> {
        let detector_path = model_dir.join(detector_model_file(model));
        let detector = FaceDetector::load(&detector_path, model, upsample)?;
        let recognizer = FaceRecognizer::load(&Self::recognizer_path(model_dir))?;

        tracing::info!(
            model = %model,
            upsample = upsample.get(),
            dir = %model_dir.display(),
            "embedding extractor ready"
        );

        Ok(Self {
            detector,
            recognizer,
        })
    }

    fn recognizer_path(model_dir: &Path) -> PathBuf {
        model_dir.join(ARCFACE_MODEL_FILE)
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
        let faces = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(faces.len());

        for face in faces {
            let embedding = self.recognizer.extract(image, &face)?;
            detections.push(Detection {
                bbox: face,
                embedding,
            });
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_model_file_per_variant() {
        assert_eq!(detector_model_file(DetectorModel::Fast), "det_500m.onnx");
        assert_eq!(detector_model_file(DetectorModel::Accurate), "det_10g.onnx");
    }

    #[test]
    fn test_load_reports_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let result = OnnxExtractor::load(
            dir.path(),
            DetectorModel::Fast,
            UpsampleFactor::new(1).unwrap(),
        );
        assert!(matches!(
            result,
            Err(ExtractorError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
