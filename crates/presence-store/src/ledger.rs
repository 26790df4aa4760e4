//! SQLite-backed attendance ledger.

use crate::db;
use crate::error::StoreResult;
use chrono::{NaiveDate, NaiveDateTime};
use presence_core::ledger::{decide, entry_for, LedgerWrite, SlotState, PRESENT_STATUS};
use presence_core::{
    AttendanceLedger, AttendanceOutcome, AttendanceRecord, LedgerEntry, LedgerError, LedgerMode,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Attendance ledger over the `attendance` table.
///
/// Each `record` runs in an IMMEDIATE transaction, so the row read and the
/// write that follows it hold the database write lock together; a second
/// station for the same slot waits (`busy_timeout`) and then reads the
/// updated row.
///
/// Calls for one slot are therefore applied one after another, never
/// merged. In `InOut` mode two stations that see the same person at the
/// same moment record IN and then OUT, exactly as two sightings a second
/// apart would. `AlreadyMarked` from a mutating transition only comes back
/// when the write itself finds the slot already taken.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
    mode: LedgerMode,
}

impl SqliteLedger {
    pub fn open(path: &Path, mode: LedgerMode) -> StoreResult<Self> {
        let conn = db::open(path)?;
        tracing::info!(path = %path.display(), ?mode, "attendance ledger opened");
        Ok(Self::with_connection(conn, mode))
    }

    pub fn with_connection(conn: Connection, mode: LedgerMode) -> Self {
        Self {
            conn: Mutex::new(conn),
            mode,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_in_tx(
        &self,
        identity_key: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) -> StoreResult<LedgerEntry> {
        let date = now.date();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = select_record(&tx, identity_key, date)?;
        let (outcome, write) = decide(self.mode, SlotState::of(self.mode, existing.as_ref()));

        let changed = match write {
            LedgerWrite::InsertIn | LedgerWrite::InsertPresent => {
                let status = (write == LedgerWrite::InsertPresent).then_some(PRESENT_STATUS);
                tx.execute(
                    "INSERT INTO attendance (identity_key, display_name, date, in_time, out_time, status)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                     ON CONFLICT (identity_key, date) DO NOTHING",
                    params![identity_key, display_name, date, now, status],
                )?
            }
            LedgerWrite::SetOut => tx.execute(
                "UPDATE attendance SET out_time = ?1
                 WHERE identity_key = ?2 AND date = ?3 AND out_time IS NULL",
                params![now, identity_key, date],
            )?,
            LedgerWrite::Nothing => 0,
        };

        tx.commit()?;

        if write != LedgerWrite::Nothing && changed == 0 {
            // Another writer got to the slot between our read and write.
            tracing::warn!(identity = identity_key, %date, "attendance slot already updated by another writer");
            return Ok(entry_for(AttendanceOutcome::AlreadyMarked, now));
        }

        tracing::info!(identity = identity_key, %date, outcome = %outcome, "attendance recorded");
        Ok(entry_for(outcome, now))
    }
}

impl AttendanceLedger for SqliteLedger {
    fn mode(&self) -> LedgerMode {
        self.mode
    }

    fn record(
        &self,
        identity_key: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) -> Result<LedgerEntry, LedgerError> {
        self.record_in_tx(identity_key, display_name, now)
            .map_err(LedgerError::from)
    }

    fn get(&self, identity_key: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, LedgerError> {
        let conn = self.lock();
        select_record(&conn, identity_key, date).map_err(LedgerError::from)
    }
}

fn select_record(
    conn: &Connection,
    identity_key: &str,
    date: NaiveDate,
) -> StoreResult<Option<AttendanceRecord>> {
    let record = conn
        .query_row(
            "SELECT identity_key, display_name, date, in_time, out_time, status
             FROM attendance WHERE identity_key = ?1 AND date = ?2",
            params![identity_key, date],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        identity_key: row.get(0)?,
        display_name: row.get(1)?,
        date: row.get(2)?,
        in_time: row.get(3)?,
        out_time: row.get(4)?,
        status: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn memory_ledger(mode: LedgerMode) -> SqliteLedger {
        SqliteLedger::with_connection(db::open_in_memory().unwrap(), mode)
    }

    #[test]
    fn test_in_out_already_marked_then_next_day() {
        let ledger = memory_ledger(LedgerMode::InOut);
        let (t1, t2, t3, t4) = (at(2, 8, 0, 1), at(2, 17, 0, 2), at(2, 17, 30, 0), at(3, 8, 0, 0));

        let e = ledger.record("S1", "Ann", t1).unwrap();
        assert_eq!((e.outcome, e.timestamp), (AttendanceOutcome::In, Some(t1)));
        let e = ledger.record("S1", "Ann", t2).unwrap();
        assert_eq!((e.outcome, e.timestamp), (AttendanceOutcome::Out, Some(t2)));
        let e = ledger.record("S1", "Ann", t3).unwrap();
        assert_eq!((e.outcome, e.timestamp), (AttendanceOutcome::AlreadyMarked, None));
        let e = ledger.record("S1", "Ann", t4).unwrap();
        assert_eq!((e.outcome, e.timestamp), (AttendanceOutcome::In, Some(t4)));

        let day1 = ledger.get("S1", t1.date()).unwrap().unwrap();
        assert_eq!(day1.in_time, Some(t1));
        assert_eq!(day1.out_time, Some(t2));
        assert_eq!(day1.status, None);
        let day2 = ledger.get("S1", t4.date()).unwrap().unwrap();
        assert_eq!(day2.out_time, None);
    }

    #[test]
    fn test_already_marked_does_not_touch_row() {
        let ledger = memory_ledger(LedgerMode::InOut);
        ledger.record("S1", "Ann", at(2, 8, 0, 0)).unwrap();
        ledger.record("S1", "Ann", at(2, 9, 0, 0)).unwrap();
        let before = ledger.get("S1", at(2, 0, 0, 0).date()).unwrap();

        ledger.record("S1", "Ann Renamed", at(2, 10, 0, 0)).unwrap();
        assert_eq!(ledger.get("S1", at(2, 0, 0, 0).date()).unwrap(), before);
    }

    #[test]
    fn test_single_present_mode() {
        let ledger = memory_ledger(LedgerMode::SinglePresent);
        let t = at(2, 9, 15, 0);
        let e = ledger.record("S1", "Ann", t).unwrap();
        assert_eq!((e.outcome, e.timestamp), (AttendanceOutcome::Present, Some(t)));
        let e = ledger.record("S1", "Ann", at(2, 12, 0, 0)).unwrap();
        assert_eq!(e.outcome, AttendanceOutcome::AlreadyMarked);

        let row = ledger.get("S1", t.date()).unwrap().unwrap();
        assert_eq!(row.status.as_deref(), Some(PRESENT_STATUS));
        assert_eq!(row.in_time, Some(t));
    }

    #[test]
    fn test_get_missing_slot() {
        let ledger = memory_ledger(LedgerMode::InOut);
        assert!(ledger.get("S9", at(2, 0, 0, 0).date()).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_stations_insert_once() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("attendance.db"));
        // Create the schema before the stations race.
        drop(db::open(&path).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let ledger = SqliteLedger::open(&path, LedgerMode::InOut).unwrap();
                    ledger.record("S1", "Ann", at(2, 8, 0, i)).unwrap().outcome
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let count = |o| outcomes.iter().filter(|&&x| x == o).count();
        assert_eq!(count(AttendanceOutcome::In), 1);
        assert_eq!(count(AttendanceOutcome::Out), 1);
        assert_eq!(count(AttendanceOutcome::AlreadyMarked), 4);

        let conn = db::open(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_unavailable_store_surfaces_error() {
        let conn = db::open_in_memory().unwrap();
        conn.execute_batch("DROP TABLE attendance;").unwrap();
        let ledger = SqliteLedger::with_connection(conn, LedgerMode::InOut);
        let err = ledger.record("S1", "Ann", at(2, 8, 0, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }
}
