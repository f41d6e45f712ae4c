use std::collections::HashSet;

use log::debug;

use crate::store::{EmbeddingRecord, EmbeddingStore};
use crate::Embedding;

/// Distance under which two faces count as the same person, calibrated for
/// the SFace embeddings the provider produces.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = facefind_vision::SAME_PERSON_DISTANCE;

/// File ids whose record holds at least one matching face.
pub type MatchSet = HashSet<String>;

/// Brute-force threshold search over an [`EmbeddingStore`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    threshold: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCE_THRESHOLD)
    }
}

impl Matcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn distance(stored: &Embedding, query: &Embedding) -> Option<f32> {
        facefind_vision::distance(stored, query)
    }

    /// A stored face matches when its distance is strictly below the threshold.
    pub fn is_match(&self, stored: &Embedding, query: &Embedding) -> bool {
        match Self::distance(stored, query) {
            Some(d) => d < self.threshold,
            None => {
                debug!(
                    "dimension mismatch: stored {} vs query {}",
                    stored.dim(),
                    query.dim()
                );
                false
            }
        }
    }

    /// Stops at the first face under the threshold.
    pub fn record_matches(&self, record: &EmbeddingRecord, query: &Embedding) -> bool {
        record.embeddings.iter().any(|e| self.is_match(e, query))
    }

    pub fn find_matches(&self, store: &EmbeddingStore, query: &Embedding) -> MatchSet {
        store
            .iter()
            .filter(|record| self.record_matches(record, query))
            .map(|record| record.file_id.clone())
            .collect()
    }

    /// Smallest distance between the query and any face in the record.
    pub fn best_distance(record: &EmbeddingRecord, query: &Embedding) -> Option<f32> {
        record
            .embeddings
            .iter()
            .filter_map(|e| Self::distance(e, query))
            .min_by(|a, b| a.total_cmp(b))
    }
}
