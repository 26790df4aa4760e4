//! Connection setup and schema.

use crate::error::{StoreError, StoreResult};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
  identity_key TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  dimension INTEGER NOT NULL,
  enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_key TEXT NOT NULL,
  display_name TEXT NOT NULL,
  date TEXT NOT NULL,
  in_time TEXT,
  out_time TEXT,
  status TEXT,
  UNIQUE (identity_key, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date DESC);

CREATE TABLE IF NOT EXISTS counters (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);
INSERT OR IGNORE INTO counters (name, value) VALUES ('enrollment_generation', 0);

CREATE TRIGGER IF NOT EXISTS enrollments_after_insert AFTER INSERT ON enrollments
BEGIN
  UPDATE counters SET value = value + 1 WHERE name = 'enrollment_generation';
END;
CREATE TRIGGER IF NOT EXISTS enrollments_after_update AFTER UPDATE ON enrollments
BEGIN
  UPDATE counters SET value = value + 1 WHERE name = 'enrollment_generation';
END;
CREATE TRIGGER IF NOT EXISTS enrollments_after_delete AFTER DELETE ON enrollments
BEGIN
  UPDATE counters SET value = value + 1 WHERE name = 'enrollment_generation';
END;
";

/// Open (creating if needed) the database at `path` and apply the schema.
///
/// Every station opens its own connection; `busy_timeout` makes a writer
/// wait for another station's transaction instead of failing immediately.
pub fn open(path: &Path) -> StoreResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| {
                StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;",
    )?;
    conn.execute_batch(SCHEMA_V1)?;

    tracing::debug!(path = %path.display(), "database opened");
    Ok(conn)
}

/// Open an existing database without creating it or touching the schema.
pub fn open_read_only(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    tracing::debug!(path = %path.display(), "database opened read-only");
    Ok(conn)
}

/// Counter bumped by every insert, update or delete on `enrollments`, from
/// any connection.
pub fn enrollment_generation(conn: &Connection) -> StoreResult<i64> {
    let value = conn.query_row(
        "SELECT value FROM counters WHERE name = 'enrollment_generation'",
        [],
        |row| row.get(0),
    )?;
    Ok(value)
}

/// In-memory database with the schema applied.
pub fn open_in_memory() -> StoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA_V1)?;
    Ok(conn)
}
