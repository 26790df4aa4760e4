//! Enrollment: collapse per-frame embeddings into one stored vector.

use crate::types::{Embedding, EnrollmentRecord};
use thiserror::Error;

/// Default number of valid embeddings an enrollment tries to collect.
pub const DEFAULT_CAPTURE_FRAMES: usize = 30;
/// Default minimum valid embeddings required before anything is persisted.
pub const DEFAULT_MIN_VALID_FRAMES: usize = 15;

#[derive(Debug, Error, PartialEq)]
pub enum EnrollmentError {
    #[error("insufficient valid face frames: captured {captured}, need at least {required}")]
    InsufficientSamples { captured: usize, required: usize },
    #[error("sample {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("sample {0} is an empty embedding")]
    EmptySample(usize),
}

/// Accumulates valid per-frame embeddings for one identity.
#[derive(Debug, Clone)]
pub struct EnrollmentSamples {
    min_samples: usize,
    samples: Vec<Embedding>,
}

impl EnrollmentSamples {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, embedding: Embedding) {
        self.samples.push(embedding);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average the samples into an enrollment record.
    pub fn finish(
        self,
        identity_key: &str,
        display_name: &str,
    ) -> Result<EnrollmentRecord, EnrollmentError> {
        let embedding = mean_embedding(&self.samples, self.min_samples)?;
        Ok(EnrollmentRecord {
            identity_key: identity_key.to_string(),
            display_name: display_name.to_string(),
            embedding,
        })
    }
}

/// Element-wise mean of `samples`.
///
/// Fails without producing anything when fewer than `min_samples` were
/// captured (at least one is always required) or the samples disagree on
/// dimension.
pub fn mean_embedding(samples: &[Embedding], min_samples: usize) -> Result<Embedding, EnrollmentError> {
    let required = min_samples.max(1);
    if samples.len() < required {
        return Err(EnrollmentError::InsufficientSamples {
            captured: samples.len(),
            required,
        });
    }

    let dim = samples[0].dimension();
    if dim == 0 {
        return Err(EnrollmentError::EmptySample(0));
    }

    // Accumulate in f64 so thirty-odd f32 samples do not drift.
    let mut sum = vec![0.0f64; dim];
    for (index, sample) in samples.iter().enumerate() {
        if sample.dimension() != dim {
            return Err(EnrollmentError::DimensionMismatch {
                index,
                expected: dim,
                actual: sample.dimension(),
            });
        }
        for (acc, &v) in sum.iter_mut().zip(sample.values.iter()) {
            *acc += f64::from(v);
        }
    }

    let n = samples.len() as f64;
    Ok(Embedding {
        values: sum.into_iter().map(|s| (s / n) as f32).collect(),
        model_version: samples[0].model_version.clone(),
    })
}
