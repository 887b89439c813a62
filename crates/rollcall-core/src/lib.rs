//! rollcall-core — Face gallery, identity matching and attendance ledger.
//!
//! Faces are detected with SCRFD and embedded with ArcFace, both running via
//! ONNX Runtime; embeddings are matched nearest-neighbour against a gallery
//! built from labeled photos, and matched sightings land in a per-day
//! attendance ledger.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use config::{Config, ConfigError, ConfigLayer, DetectorModel, DownscaleFactor, Tolerance, UpsampleFactor};
pub use extractor::{ExtractorError, FaceExtractor, OnnxExtractor};
pub use gallery::{BuildReport, Gallery, GalleryBuilder, GalleryEntry, GalleryError, MultiFacePolicy};
pub use ledger::{AttendanceRecord, Ledger, LedgerError, Sighting};
pub use matcher::{Identity, MatchResult, Matcher, NearestNeighborMatcher};
pub use store::{CsvStore, LedgerStore, MemoryStore, StoreError};
pub use types::{BoundingBox, Detection, Embedding};
