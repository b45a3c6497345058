//! Nearest-neighbour identity matching over the embedding gallery.

use crate::gallery::{EmbeddingStore, GalleryEntry, GalleryError};
use crate::types::{euclidean_distance, Embedding, UNKNOWN_LABEL};
use uuid::Uuid;

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Label of the accepted match, `None` for an unknown face.
    pub label: Option<String>,
    /// Distance to the nearest gallery entry (`+inf` for an empty gallery).
    pub distance: f32,
    /// Gallery entry that produced the match (if any).
    pub entry_id: Option<Uuid>,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: None,
            distance,
            entry_id: None,
        }
    }

    /// Display name: the matched label or `"Unknown"`.
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }

    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &[f32], gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Always iterates ALL gallery entries. The first entry reaching the minimum
/// distance wins, so exact ties resolve to insertion order. A match is
/// accepted only when that distance is strictly below the threshold.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &[f32], gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = euclidean_distance(probe, &entry.vector);
            // Strict comparison keeps the earliest entry on ties.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                label: Some(gallery[idx].label.clone()),
                distance: best_dist,
                entry_id: Some(gallery[idx].id),
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}

/// Gallery plus acceptance threshold: the component the pipeline asks for labels.
pub struct IdentityMatcher {
    store: EmbeddingStore,
    threshold: f32,
}

impl IdentityMatcher {
    pub fn new(store: EmbeddingStore, threshold: f32) -> Self {
        Self { store, threshold }
    }

    /// Match with the configured threshold.
    pub fn identify(&self, probe: &Embedding) -> MatchResult {
        let result = self.store.match_vector(&probe.values, self.threshold);
        if !result.is_known() {
            tracing::debug!(distance = result.distance, "no gallery match");
        }
        result
    }

    /// Match with an explicit threshold.
    pub fn match_vector(&self, query: &[f32], threshold: f32) -> MatchResult {
        self.store.match_vector(query, threshold)
    }

    pub fn register(&mut self, label: &str, embedding: Embedding) -> Result<Uuid, GalleryError> {
        self.store.register(label, embedding.values)
    }

    pub fn remove(&mut self, label: &str) -> Result<usize, GalleryError> {
        self.store.remove(label)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EmbeddingStore {
        &mut self.store
    }

    pub fn into_store(self) -> EmbeddingStore {
        self.store
    }
}
