use serde::{Deserialize, Serialize};

/// Face embedding vector produced by the external embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "Facenet"), if the embedder reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Number of components in the vector.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers are responsible for comparing equal-dimension vectors; the
    /// gallery enforces a single dimension on insert.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled person: identity key, display name, and the averaged embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity_key: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Outcome of a nearest-neighbour query against the gallery.
///
/// `identity_key` is `None` on reject; `distance` is always the minimum
/// distance found so it can be logged for threshold calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity_key: Option<String>,
    /// Display name of the accepted identity.
    pub display_name: Option<String>,
    pub distance: f32,
}

impl MatchResult {
    /// Reject result for an empty gallery or an unusable probe.
    pub fn no_candidates() -> Self {
        Self {
            identity_key: None,
            display_name: None,
            distance: f32::INFINITY,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.identity_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.5, -1.0, 2.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_geometry() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![-1.0, 0.5, 7.0]);
        assert!((a.euclidean_distance(&b) - b.euclidean_distance(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_no_candidates_is_rejected_with_infinite_distance() {
        let result = MatchResult::no_candidates();
        assert!(!result.is_accepted());
        assert!(result.distance.is_infinite());
    }
}
