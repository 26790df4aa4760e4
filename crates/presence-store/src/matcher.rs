//! Identity matching against the persisted enrollment set.

use crate::enrollments::EnrollmentRepository;
use crate::error::StoreResult;
use presence_core::{Embedding, EmbeddingStore, IdentityMatcher, LinearScanMatcher, MatchResult};
use std::sync::{Arc, Mutex, MutexGuard};

/// Linear-scan matcher that follows the `enrollments` table.
///
/// Every query first compares the enrollment generation with the one the
/// gallery was built from. On a change the gallery is reloaded from the
/// repository and swapped in whole, so an enrollment or removal made by any
/// process applies from the next query on.
pub struct RepositoryMatcher {
    repo: EnrollmentRepository,
    store: Arc<EmbeddingStore>,
    scan: LinearScanMatcher,
    generation: Mutex<i64>,
}

impl RepositoryMatcher {
    pub fn new(repo: EnrollmentRepository, threshold: f32) -> StoreResult<Self> {
        let generation = repo.generation()?;
        let (store, _) = repo.load()?;
        let store = Arc::new(store);
        Ok(Self {
            scan: LinearScanMatcher::new(store.clone(), threshold),
            repo,
            store,
            generation: Mutex::new(generation),
        })
    }

    fn loaded_generation(&self) -> MutexGuard<'_, i64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identities currently in the gallery.
    pub fn enrolled(&self) -> usize {
        self.store.len()
    }

    /// Reload the gallery if enrollments changed since it was built.
    /// Returns whether a reload happened.
    pub fn refresh(&self) -> StoreResult<bool> {
        let mut loaded = self.loaded_generation();
        let current = self.repo.generation()?;
        if current == *loaded {
            return Ok(false);
        }

        let (fresh, summary) = self.repo.load()?;
        self.store.replace_all(fresh);
        tracing::info!(
            from = *loaded,
            to = current,
            enrolled = summary.loaded,
            skipped = summary.skipped,
            "enrollments changed; gallery reloaded"
        );
        *loaded = current;
        Ok(true)
    }
}

impl IdentityMatcher for RepositoryMatcher {
    /// A probe that cannot be checked against the current enrollments is
    /// rejected.
    fn query(&self, probe: &Embedding) -> MatchResult {
        if let Err(e) = self.refresh() {
            tracing::warn!(error = %e, "failed to check enrollments; rejecting probe");
            return MatchResult::no_candidates();
        }
        self.scan.query(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::gallery::record;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Two repositories on one database, as two processes would have.
    fn open_pair(tmp: &TempDir) -> (EnrollmentRepository, EnrollmentRepository) {
        let db = tmp.path().join("attendance.db");
        let vectors: PathBuf = tmp.path().join("embeddings");
        (
            EnrollmentRepository::open(&db, &vectors).unwrap(),
            EnrollmentRepository::open(&db, &vectors).unwrap(),
        )
    }

    #[test]
    fn test_removed_identity_is_denied_on_next_query() {
        let tmp = TempDir::new().unwrap();
        let (admin, session_repo) = open_pair(&tmp);
        admin.enroll(&record("S1", "Ann", vec![0.0, 0.0])).unwrap();
        admin.enroll(&record("S2", "Bo", vec![5.0, 0.0])).unwrap();

        let matcher = RepositoryMatcher::new(session_repo, 1.0).unwrap();
        let probe = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(matcher.query(&probe).identity_key.as_deref(), Some("S1"));

        assert!(admin.remove("S1").unwrap());

        let result = matcher.query(&probe);
        assert!(!result.is_accepted());
        assert!((result.distance - 5.0).abs() < 1e-6);
        assert_eq!(matcher.enrolled(), 1);
    }

    #[test]
    fn test_new_enrollment_is_accepted_on_next_query() {
        let tmp = TempDir::new().unwrap();
        let (admin, session_repo) = open_pair(&tmp);

        let matcher = RepositoryMatcher::new(session_repo, 1.0).unwrap();
        let probe = Embedding::new(vec![1.0, 2.0]);
        assert!(matcher.query(&probe).distance.is_infinite());

        admin.enroll(&record("S7", "Gil", vec![1.0, 2.1])).unwrap();

        let result = matcher.query(&probe);
        assert_eq!(result.identity_key.as_deref(), Some("S7"));
        assert_eq!(result.display_name.as_deref(), Some("Gil"));
    }

    #[test]
    fn test_re_enrollment_replaces_vector() {
        let tmp = TempDir::new().unwrap();
        let (admin, session_repo) = open_pair(&tmp);
        admin.enroll(&record("S1", "Ann", vec![0.0, 0.0])).unwrap();

        let matcher = RepositoryMatcher::new(session_repo, 1.0).unwrap();
        let probe = Embedding::new(vec![4.0, 0.0]);
        assert!(!matcher.query(&probe).is_accepted());

        admin.enroll(&record("S1", "Ann", vec![4.0, 0.0])).unwrap();
        assert_eq!(matcher.query(&probe).distance, 0.0);
    }

    #[test]
    fn test_refresh_only_reloads_on_change() {
        let tmp = TempDir::new().unwrap();
        let (admin, session_repo) = open_pair(&tmp);
        admin.enroll(&record("S1", "Ann", vec![0.0, 0.0])).unwrap();

        let matcher = RepositoryMatcher::new(session_repo, 1.0).unwrap();
        assert!(!matcher.refresh().unwrap());

        admin.enroll(&record("S2", "Bo", vec![1.0, 1.0])).unwrap();
        assert!(matcher.refresh().unwrap());
        assert!(!matcher.refresh().unwrap());
        assert_eq!(matcher.enrolled(), 2);
    }

    #[test]
    fn test_removing_everyone_allows_new_dimension() {
        let tmp = TempDir::new().unwrap();
        let (admin, session_repo) = open_pair(&tmp);
        admin.enroll(&record("S1", "Ann", vec![0.0, 0.0, 0.0])).unwrap();
        let matcher = RepositoryMatcher::new(session_repo, 1.0).unwrap();

        admin.remove("S1").unwrap();
        admin.enroll(&record("S2", "Bo", vec![1.0, 1.0])).unwrap();

        let result = matcher.query(&Embedding::new(vec![1.0, 1.0]));
        assert_eq!(result.identity_key.as_deref(), Some("S2"));
    }
}
