//! Nearest-identity search over a gallery snapshot.

use crate::gallery::GallerySnapshot;
use crate::types::{EmbeddingVector, GalleryEntry, MatchResult};
use serde::{Deserialize, Serialize};

/// Similarity metric. One deployment uses exactly one; scores from different
/// metrics are never compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity in [-1, 1].
    #[default]
    Cosine,
    /// Negated Euclidean distance, so higher is still better.
    NegativeEuclidean,
}

impl Metric {
    pub fn score(&self, query: &EmbeddingVector, candidate: &EmbeddingVector) -> f32 {
        match self {
            Metric::Cosine => query.similarity(candidate),
            Metric::NegativeEuclidean => -query.euclidean_distance(candidate),
        }
    }
}

/// Strategy for comparing a query embedding against a gallery snapshot.
pub trait Matcher: Send + Sync {
    fn best_match(&self, query: &EmbeddingVector, gallery: &GallerySnapshot) -> MatchResult;
}

/// Exhaustive scan, fine for galleries of tens to low hundreds of entries.
///
/// Every entry is visited; there is no early exit. Equal best scores resolve
/// to the lexicographically smaller `person_id`.
#[derive(Debug, Clone)]
pub struct LinearMatcher {
    metric: Metric,
    accept_threshold: f32,
}

impl LinearMatcher {
    pub fn new(metric: Metric, accept_threshold: f32) -> Self {
        Self {
            metric,
            accept_threshold,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn accept_threshold(&self) -> f32 {
        self.accept_threshold
    }
}

impl Matcher for LinearMatcher {
    fn best_match(&self, query: &EmbeddingVector, gallery: &GallerySnapshot) -> MatchResult {
        let mut best: Option<(f32, &GalleryEntry)> = None;
        let mut skipped = 0usize;

        for entry in gallery.entries() {
            if !query.is_comparable(&entry.embedding) {
                skipped += 1;
                continue;
            }
            let score = self.metric.score(query, &entry.embedding);
            if !score.is_finite() {
                skipped += 1;
                continue;
            }

            let better = match best {
                None => true,
                Some((best_score, best_entry)) => {
                    score > best_score
                        || (score == best_score && entry.person_id < best_entry.person_id)
                }
            };
            if better {
                best = Some((score, entry));
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, "gallery entries not comparable with query embedding");
        }

        match best {
            Some((score, entry)) if score >= self.accept_threshold => MatchResult {
                person_id: Some(entry.person_id.clone()),
                display_name: Some(entry.display_name.clone()),
                confidence: score,
            },
            Some((score, _)) => MatchResult::no_match(score),
            None => MatchResult::no_match(0.0),
        }
    }
}
