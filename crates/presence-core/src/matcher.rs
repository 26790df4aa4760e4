//! Nearest-neighbour identity matching.

use crate::gallery::EmbeddingStore;
use crate::types::{Embedding, MatchResult};
use std::sync::Arc;

/// Strategy for resolving a probe embedding to an enrolled identity.
///
/// The session only sees this trait, so an indexed structure can replace the
/// linear scan without touching callers.
pub trait IdentityMatcher {
    fn query(&self, probe: &Embedding) -> MatchResult;
}

/// Brute-force Euclidean matcher: O(n·D) over the whole gallery.
///
/// Always visits every enrolled vector. Ties keep the first identity in
/// gallery order (identity-key order), so results are reproducible.
pub struct LinearScanMatcher {
    store: Arc<EmbeddingStore>,
    threshold: f32,
}

impl LinearScanMatcher {
    /// `threshold` is the calibrated acceptance distance: a match is accepted
    /// only when the nearest distance is strictly below it.
    pub fn new(store: Arc<EmbeddingStore>, threshold: f32) -> Self {
        Self { store, threshold }
    }
}

impl IdentityMatcher for LinearScanMatcher {
    fn query(&self, probe: &Embedding) -> MatchResult {
        let threshold = self.threshold;
        self.store.with_snapshot(|dimension, records| {
            if let Some(expected) = dimension {
                if probe.dimension() != expected {
                    tracing::warn!(
                        expected,
                        actual = probe.dimension(),
                        "probe embedding dimension does not match gallery"
                    );
                    return MatchResult::no_candidates();
                }
            }

            let mut best_dist = f32::INFINITY;
            let mut best: Option<(&str, &str)> = None;

            for record in records {
                let dist = probe.euclidean_distance(&record.embedding);
                if dist < best_dist {
                    best_dist = dist;
                    best = Some((&record.identity_key, &record.display_name));
                }
            }

            match best {
                Some((key, name)) if best_dist < threshold => MatchResult {
                    identity_key: Some(key.to_string()),
                    display_name: Some(name.to_string()),
                    distance: best_dist,
                },
                _ => MatchResult {
                    identity_key: None,
                    display_name: None,
                    distance: best_dist,
                },
            }
        })
    }
}
