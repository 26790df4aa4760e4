//! In-memory gallery of enrolled embeddings.
//!
//! Holds at most one record per identity key. Writers take the write lock for
//! the whole insert-or-replace, and readers scan under the read lock, so a
//! matching scan never observes a half-applied enrollment.

use crate::types::{EnrollmentRecord, Embedding};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("embedding for '{identity_key}' has dimension {actual}, gallery dimension is {expected}")]
    DimensionMismatch {
        identity_key: String,
        expected: usize,
        actual: usize,
    },
    #[error("embedding for '{0}' is empty")]
    EmptyEmbedding(String),
}

#[derive(Debug, Default)]
struct Gallery {
    /// Fixed by the first enrolled vector; cleared when the gallery empties.
    dimension: Option<usize>,
    /// Keyed by identity; BTreeMap gives a stable scan order.
    records: BTreeMap<String, EnrollmentRecord>,
}

/// Identity key → embedding mapping shared between sessions.
#[derive(Debug, Default)]
pub struct EmbeddingStore {
    inner: RwLock<Gallery>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Gallery> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Gallery> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the record for its identity key.
    ///
    /// Returns the replaced record, if any.
    pub fn upsert(&self, record: EnrollmentRecord) -> Result<Option<EnrollmentRecord>, StoreError> {
        let actual = record.embedding.dimension();
        if actual == 0 {
            return Err(StoreError::EmptyEmbedding(record.identity_key));
        }

        let mut gallery = self.write();
        match gallery.dimension {
            Some(expected) if expected != actual => {
                return Err(StoreError::DimensionMismatch {
                    identity_key: record.identity_key,
                    expected,
                    actual,
                });
            }
            Some(_) => {}
            None => gallery.dimension = Some(actual),
        }

        let previous = gallery.records.insert(record.identity_key.clone(), record);
        Ok(previous)
    }

    pub fn remove(&self, identity_key: &str) -> Option<EnrollmentRecord> {
        let mut gallery = self.write();
        let removed = gallery.records.remove(identity_key);
        if gallery.records.is_empty() {
            gallery.dimension = None;
        }
        removed
    }

    /// Swap in the whole contents of `other` under one write lock.
    ///
    /// A concurrent scan sees either the old gallery or the new one.
    pub fn replace_all(&self, other: EmbeddingStore) {
        let fresh = other.inner.into_inner().unwrap_or_else(|e| e.into_inner());
        *self.write() = fresh;
    }

    pub fn get(&self, identity_key: &str) -> Option<EnrollmentRecord> {
        self.read().records.get(identity_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.read().dimension
    }

    /// Identity keys in scan order.
    pub fn identities(&self) -> Vec<String> {
        self.read().records.keys().cloned().collect()
    }

    /// Run `f` over every record, in identity-key order, under one read lock.
    pub fn scan<F>(&self, mut f: F)
    where
        F: FnMut(&EnrollmentRecord),
    {
        let gallery = self.read();
        for record in gallery.records.values() {
            f(record);
        }
    }

    /// Run `f` with a consistent view of the gallery dimension and records.
    pub(crate) fn with_snapshot<R>(
        &self,
        f: impl FnOnce(Option<usize>, &mut dyn Iterator<Item = &EnrollmentRecord>) -> R,
    ) -> R {
        let gallery = self.read();
        let mut iter = gallery.records.values();
        f(gallery.dimension, &mut iter)
    }
}

/// Convenience constructor used by tests and loaders.
pub fn record(identity_key: &str, display_name: &str, values: Vec<f32>) -> EnrollmentRecord {
    EnrollmentRecord {
        identity_key: identity_key.to_string(),
        display_name: display_name.to_string(),
        embedding: Embedding::new(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_existing_identity() {
        let store = EmbeddingStore::new();
        assert!(store.upsert(record("S1", "Ann", vec![1.0, 0.0])).unwrap().is_none());
        let previous = store.upsert(record("S1", "Ann B.", vec![0.0, 1.0])).unwrap();

        assert_eq!(previous.unwrap().display_name, "Ann");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("S1").unwrap().embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_first_insert_fixes_dimension() {
        let store = EmbeddingStore::new();
        store.upsert(record("S1", "Ann", vec![1.0, 0.0, 0.0])).unwrap();
        let err = store.upsert(record("S2", "Bob", vec![1.0, 0.0])).unwrap_err();
        assert_eq!(
            err,
            StoreError::DimensionMismatch {
                identity_key: "S2".into(),
                expected: 3,
                actual: 2,
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_emptied_gallery_accepts_new_dimension() {
        let store = EmbeddingStore::new();
        store.upsert(record("S1", "Ann", vec![1.0, 0.0, 0.0])).unwrap();
        store.upsert(record("S2", "Bob", vec![0.0, 1.0, 0.0])).unwrap();

        store.remove("S1");
        assert_eq!(store.dimension(), Some(3));
        store.remove("S2");
        assert_eq!(store.dimension(), None);

        store.upsert(record("S3", "Cyd", vec![1.0, 0.0])).unwrap();
        assert_eq!(store.dimension(), Some(2));
    }

    #[test]
    fn test_replace_all_swaps_records_and_dimension() {
        let store = EmbeddingStore::new();
        store.upsert(record("S1", "Ann", vec![1.0, 0.0, 0.0])).unwrap();

        let fresh = EmbeddingStore::new();
        fresh.upsert(record("S2", "Bob", vec![0.0, 1.0])).unwrap();
        store.replace_all(fresh);

        assert_eq!(store.identities(), vec!["S2".to_string()]);
        assert_eq!(store.dimension(), Some(2));
        assert!(store.get("S1").is_none());
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let store = EmbeddingStore::new();
        assert_eq!(
            store.upsert(record("S1", "Ann", vec![])).unwrap_err(),
            StoreError::EmptyEmbedding("S1".into())
        );
    }

    #[test]
    fn test_scan_order_is_by_identity_key() {
        let store = EmbeddingStore::new();
        store.upsert(record("S3", "C", vec![1.0])).unwrap();
        store.upsert(record("S1", "A", vec![1.0])).unwrap();
        store.upsert(record("S2", "B", vec![1.0])).unwrap();

        let mut seen = Vec::new();
        store.scan(|r| seen.push(r.identity_key.clone()));
        assert_eq!(seen, vec!["S1", "S2", "S3"]);
        assert_eq!(store.identities(), seen);
    }

    #[test]
    fn test_remove() {
        let store = EmbeddingStore::new();
        store.upsert(record("S1", "Ann", vec![1.0])).unwrap();
        assert!(store.remove("S1").is_some());
        assert!(store.remove("S1").is_none());
        assert!(store.is_empty());
    }
}
