//! Enrolled identities: a row per identity in `enrollments` plus one JSON
//! embedding file per identity under the vectors directory.

use crate::db;
use crate::error::{StoreError, StoreResult};
use chrono::{Local, NaiveDateTime};
use presence_core::{EmbeddingStore, EnrollmentRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

const MAX_IDENTITY_KEY_LEN: usize = 128;

/// Row of the `enrollments` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledIdentity {
    pub identity_key: String,
    pub display_name: String,
    pub dimension: usize,
    pub enrolled_at: NaiveDateTime,
}

/// Result of loading persisted embeddings into a gallery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
}

pub struct EnrollmentRepository {
    conn: Mutex<Connection>,
    vectors_dir: PathBuf,
}

/// Identity keys double as file names, so only a conservative character set is allowed.
pub fn validate_identity_key(key: &str) -> StoreResult<()> {
    let invalid = |message: &str| StoreError::InvalidIdentity {
        key: key.to_string(),
        message: message.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if key.len() > MAX_IDENTITY_KEY_LEN {
        return Err(invalid("longer than 128 characters"));
    }
    if key.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only ASCII letters, digits, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

impl EnrollmentRepository {
    pub fn open(db_path: &Path, vectors_dir: &Path) -> StoreResult<Self> {
        let conn = db::open(db_path)?;
        Ok(Self::with_connection(conn, vectors_dir))
    }

    pub fn with_connection(conn: Connection, vectors_dir: &Path) -> Self {
        Self {
            conn: Mutex::new(conn),
            vectors_dir: vectors_dir.to_path_buf(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value of the enrollment change counter.
    pub fn generation(&self) -> StoreResult<i64> {
        db::enrollment_generation(&self.lock())
    }

    pub fn vector_path(&self, identity_key: &str) -> PathBuf {
        self.vectors_dir.join(format!("{identity_key}.json"))
    }

    /// Persist `record`, replacing any earlier enrollment for the same key.
    ///
    /// The vector file is written first so a row never points at a missing file.
    pub fn enroll(&self, record: &EnrollmentRecord) -> StoreResult<EnrolledIdentity> {
        validate_identity_key(&record.identity_key)?;
        if record.embedding.values.is_empty() {
            return Err(presence_core::gallery::StoreError::EmptyEmbedding(
                record.identity_key.clone(),
            )
            .into());
        }

        let path = self.vector_path(&record.identity_key);
        write_vector_file(&path, record)?;

        let enrolled = EnrolledIdentity {
            identity_key: record.identity_key.clone(),
            display_name: record.display_name.clone(),
            dimension: record.embedding.dimension(),
            enrolled_at: Local::now().naive_local(),
        };
        self.lock().execute(
            "INSERT INTO enrollments (identity_key, display_name, dimension, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (identity_key) DO UPDATE SET
               display_name = excluded.display_name,
               dimension = excluded.dimension,
               enrolled_at = excluded.enrolled_at",
            params![
                enrolled.identity_key,
                enrolled.display_name,
                enrolled.dimension as i64,
                enrolled.enrolled_at
            ],
        )?;

        tracing::info!(
            identity = %enrolled.identity_key,
            dimension = enrolled.dimension,
            path = %path.display(),
            "identity enrolled"
        );
        Ok(enrolled)
    }

    pub fn list(&self) -> StoreResult<Vec<EnrolledIdentity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT identity_key, display_name, dimension, enrolled_at
             FROM enrollments ORDER BY identity_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EnrolledIdentity {
                    identity_key: row.get(0)?,
                    display_name: row.get(1)?,
                    dimension: row.get::<_, i64>(2)? as usize,
                    enrolled_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, identity_key: &str) -> StoreResult<Option<EnrolledIdentity>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT identity_key, display_name, dimension, enrolled_at
                 FROM enrollments WHERE identity_key = ?1",
                params![identity_key],
                |row| {
                    Ok(EnrolledIdentity {
                        identity_key: row.get(0)?,
                        display_name: row.get(1)?,
                        dimension: row.get::<_, i64>(2)? as usize,
                        enrolled_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete the row and vector file. Returns `false` if the key was not enrolled.
    pub fn remove(&self, identity_key: &str) -> StoreResult<bool> {
        validate_identity_key(identity_key)?;
        let deleted = self.lock().execute(
            "DELETE FROM enrollments WHERE identity_key = ?1",
            params![identity_key],
        )?;

        let path = self.vector_path(identity_key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::VectorWrite { path, source }),
        }

        if deleted > 0 {
            tracing::info!(identity = identity_key, "enrollment removed");
        }
        Ok(deleted > 0)
    }

    /// Read a single persisted embedding.
    pub fn read_record(&self, identity_key: &str) -> StoreResult<EnrollmentRecord> {
        read_vector_file(&self.vector_path(identity_key), identity_key)
    }

    /// Load every enrolled identity into `store`.
    ///
    /// Identities whose vector file is missing, unreadable or of a different
    /// dimension than the gallery are skipped with a warning.
    pub fn load_into(&self, store: &EmbeddingStore) -> StoreResult<LoadSummary> {
        let mut summary = LoadSummary::default();
        for enrolled in self.list()? {
            let loaded = self
                .read_record(&enrolled.identity_key)
                .and_then(|record| store.upsert(record).map_err(StoreError::from));
            match loaded {
                Ok(_) => summary.loaded += 1,
                Err(e) => {
                    tracing::warn!(identity = %enrolled.identity_key, error = %e, "skipping enrollment");
                    summary.skipped += 1;
                }
            }
        }
        tracing::info!(
            loaded = summary.loaded,
            skipped = summary.skipped,
            "embedding gallery loaded"
        );
        Ok(summary)
    }

    /// Build a fresh gallery from everything persisted.
    pub fn load(&self) -> StoreResult<(EmbeddingStore, LoadSummary)> {
        let store = EmbeddingStore::new();
        let summary = self.load_into(&store)?;
        Ok((store, summary))
    }
}

fn write_vector_file(path: &Path, record: &EnrollmentRecord) -> StoreResult<()> {
    let write_err = |source| StoreError::VectorWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            serde_json::to_writer_pretty(&mut writer, record)?;
            writer.write_all(b"\n").map_err(write_err)?;
            writer.flush().map_err(write_err)?;
        }
        file.sync_all().map_err(write_err)?;
    }

    let file = tmp.persist(path).map_err(|err| write_err(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_err)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}

fn read_vector_file(path: &Path, identity_key: &str) -> StoreResult<EnrollmentRecord> {
    let data = fs::read(path).map_err(|source| StoreError::VectorRead {
        path: path.to_path_buf(),
        source,
    })?;
    let record: EnrollmentRecord =
        serde_json::from_slice(&data).map_err(|e| StoreError::CorruptVector {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if record.identity_key != identity_key {
        return Err(StoreError::CorruptVector {
            path: path.to_path_buf(),
            message: format!("file belongs to '{}'", record.identity_key),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::gallery::record;
    use tempfile::TempDir;

    fn repo(tmp: &TempDir) -> EnrollmentRepository {
        EnrollmentRepository::open(&tmp.path().join("attendance.db"), &tmp.path().join("embeddings"))
            .unwrap()
    }

    #[test]
    fn test_validate_identity_key() {
        assert!(validate_identity_key("21BCE1234").is_ok());
        assert!(validate_identity_key("ann.lee_2-b").is_ok());
        assert!(validate_identity_key("").is_err());
        assert!(validate_identity_key(".hidden").is_err());
        assert!(validate_identity_key("../etc/passwd").is_err());
        assert!(validate_identity_key("a/b").is_err());
        assert!(validate_identity_key("with space").is_err());
        assert!(validate_identity_key(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_enroll_and_load() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S2", "Bo", vec![1.0, 0.0])).unwrap();
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();

        assert!(repo.vector_path("S1").exists());
        let keys: Vec<_> = repo.list().unwrap().into_iter().map(|e| e.identity_key).collect();
        assert_eq!(keys, vec!["S1", "S2"]);

        let (store, summary) = repo.load().unwrap();
        assert_eq!(summary, LoadSummary { loaded: 2, skipped: 0 });
        assert_eq!(store.get("S2").unwrap().embedding.values, vec![1.0, 0.0]);
        assert_eq!(store.get("S1").unwrap().display_name, "Ann");
    }

    #[test]
    fn test_re_enroll_replaces_vector_and_name() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();
        repo.enroll(&record("S1", "Ann Lee", vec![2.0, 3.0])).unwrap();

        let listed = repo.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_name, "Ann Lee");
        assert_eq!(repo.read_record("S1").unwrap().embedding.values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_enroll_rejects_bad_key_and_empty_vector() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        assert!(matches!(
            repo.enroll(&record("../x", "X", vec![1.0])),
            Err(StoreError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            repo.enroll(&record("S1", "Ann", vec![])),
            Err(StoreError::Gallery(_))
        ));
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_missing_and_corrupt_files() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();
        repo.enroll(&record("S2", "Bo", vec![1.0, 0.0])).unwrap();
        repo.enroll(&record("S3", "Cy", vec![1.0, 1.0])).unwrap();

        fs::remove_file(repo.vector_path("S2")).unwrap();
        fs::write(repo.vector_path("S3"), b"{not json").unwrap();

        let (store, summary) = repo.load().unwrap();
        assert_eq!(summary, LoadSummary { loaded: 1, skipped: 2 });
        assert_eq!(store.identities(), vec!["S1".to_string()]);
    }

    #[test]
    fn test_load_skips_dimension_mismatch() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();
        repo.enroll(&record("S2", "Bo", vec![1.0, 0.0, 0.5])).unwrap();

        let (store, summary) = repo.load().unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.dimension(), Some(2));
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();

        assert!(repo.remove("S1").unwrap());
        assert!(!repo.vector_path("S1").exists());
        assert!(repo.get("S1").unwrap().is_none());
        assert!(!repo.remove("S1").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_vector_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.enroll(&record("S1", "Ann", vec![0.0, 1.0])).unwrap();
        let mode = fs::metadata(repo.vector_path("S1")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
