//! Identity matching: nearest neighbour over every reference embedding.

use crate::config::Tolerance;
use crate::gallery::Gallery;
use crate::types::Embedding;
use serde::Serialize;
use std::fmt;

/// Who a detected face belongs to.
///
/// `Unknown` is a distinct variant rather than a sentinel label, so an
/// unmatched face can never be recorded as an attendee by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "label", rename_all = "lowercase")]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Known(label) => Some(label),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(label) => f.write_str(label),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Result of matching one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the closest reference embedding (`+inf` for an empty gallery).
    pub distance: f32,
}

/// Strategy for comparing a query embedding against a gallery of reference faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, tolerance: Tolerance) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// The candidate is the label owning the single closest reference embedding;
/// labels are never averaged. The match is accepted iff
/// `distance <= tolerance`. On equal distances the entry inserted first wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborMatcher;

impl Matcher for NearestNeighborMatcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, tolerance: Tolerance) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let distance = query.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the earliest entry on ties.
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance <= tolerance.get() => MatchResult {
                identity: Identity::Known(gallery.entries()[idx].label.clone()),
                distance: best_distance,
            },
            _ => MatchResult {
                identity: Identity::Unknown,
                distance: best_distance,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;
    use std::path::PathBuf;

    fn entry(label: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            label: label.into(),
            embedding: Embedding::new(values),
            source: PathBuf::from(format!("{label}.jpg")),
        }
    }

    fn tolerance(t: f32) -> Tolerance {
        Tolerance::new(t).unwrap()
    }

    #[test]
    fn test_nearest_reference_wins_over_label_average() {
        // Bob has one far photo and one very close photo; averaging would
        // favour Alice, nearest-neighbour picks Bob.
        let gallery = Gallery::from_entries(vec![
            entry("alice", vec![0.3, 0.0]),
            entry("bob", vec![1.5, 0.0]),
            entry("bob", vec![0.1, 0.0]),
        ])
        .unwrap();

        let query = Embedding::new(vec![0.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(0.5));
        assert_eq!(result.identity, Identity::Known("bob".into()));
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_beyond_tolerance_is_unknown() {
        let gallery = Gallery::from_entries(vec![entry("alice", vec![1.0, 0.0])]).unwrap();
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(0.5));
        assert_eq!(result.identity, Identity::Unknown);
        assert!((result.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_equal_to_tolerance_is_known() {
        // 0.5 and 0.25 are exact in binary, so the distance is exactly 0.5.
        let gallery = Gallery::from_entries(vec![entry("alice", vec![0.5, 0.0])]).unwrap();
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(0.5));
        assert_eq!(result.distance, 0.5);
        assert_eq!(result.identity, Identity::Known("alice".into()));
    }

    #[test]
    fn test_just_over_tolerance_is_unknown() {
        let gallery = Gallery::from_entries(vec![entry("alice", vec![0.5, 0.0])]).unwrap();
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(0.4999));
        assert_eq!(result.identity, Identity::Unknown);
    }

    #[test]
    fn test_tie_resolves_to_first_inserted_label() {
        let gallery = Gallery::from_entries(vec![
            entry("zoe", vec![0.0, 0.2]),
            entry("adam", vec![0.2, 0.0]),
        ])
        .unwrap();
        let query = Embedding::new(vec![0.0, 0.0]);

        for _ in 0..10 {
            let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(0.5));
            assert_eq!(result.identity, Identity::Known("zoe".into()));
        }

        let reversed = Gallery::from_entries(vec![
            entry("adam", vec![0.2, 0.0]),
            entry("zoe", vec![0.0, 0.2]),
        ])
        .unwrap();
        let result = NearestNeighborMatcher.compare(&query, &reversed, tolerance(0.5));
        assert_eq!(result.identity, Identity::Known("adam".into()));
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let gallery = Gallery::from_entries(Vec::new()).unwrap();
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(2.0));
        assert_eq!(result.identity, Identity::Unknown);
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let gallery = Gallery::from_entries(vec![entry("alice", vec![0.0, 0.0])]).unwrap();
        let query = Embedding::new(vec![0.0, 0.0, 0.0]);
        let result = NearestNeighborMatcher.compare(&query, &gallery, tolerance(2.0));
        assert_eq!(result.identity, Identity::Unknown);
    }

    #[test]
    fn test_identity_display_and_label() {
        assert_eq!(Identity::Known("alice".into()).to_string(), "alice");
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
        assert_eq!(Identity::Unknown.label(), None);
        assert!(!Identity::Unknown.is_known());
    }
}
