//! Read-only attendance reports.

use crate::db;
use crate::error::StoreResult;
use crate::ledger::row_to_record;
use chrono::NaiveDate;
use presence_core::AttendanceRecord;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::path::Path;

/// Row filter for [`Reports::records`]. Empty filter returns everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub date: Option<NaiveDate>,
    pub identity_key: Option<String>,
}

/// Per-identity attendance over every day present in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub identity_key: String,
    pub display_name: String,
    pub total_days: u32,
    pub present_days: u32,
    pub attendance_percentage: f64,
}

pub struct Reports {
    conn: Connection,
}

impl Reports {
    /// Open an existing database read-only. A missing file is an error.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            conn: db::open_read_only(path)?,
        })
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Attendance rows, newest date first.
    pub fn records(&self, filter: &RecordFilter) -> StoreResult<Vec<AttendanceRecord>> {
        let mut sql = String::from(
            "SELECT identity_key, display_name, date, in_time, out_time, status FROM attendance",
        );
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(date) = filter.date {
            clauses.push("date = ?");
            args.push(Value::Text(date.format("%Y-%m-%d").to_string()));
        }
        if let Some(key) = &filter.identity_key {
            clauses.push("identity_key = ?");
            args.push(Value::Text(key.clone()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY date DESC, identity_key");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Summary for every enrolled identity, plus any identity that only
    /// appears in the ledger.
    ///
    /// `total_days` is the number of distinct dates with any attendance row;
    /// `present_days` counts the identity's rows with an in-time.
    pub fn summary(&self) -> StoreResult<Vec<AttendanceSummary>> {
        let total_days: i64 =
            self.conn
                .query_row("SELECT COUNT(DISTINCT date) FROM attendance", [], |r| r.get(0))?;

        let mut stmt = self.conn.prepare(
            "WITH people AS (
               SELECT identity_key, display_name FROM enrollments
               UNION
               SELECT identity_key, MAX(display_name) FROM attendance
               WHERE identity_key NOT IN (SELECT identity_key FROM enrollments)
               GROUP BY identity_key
             )
             SELECT p.identity_key, p.display_name,
                    (SELECT COUNT(*) FROM attendance a
                     WHERE a.identity_key = p.identity_key AND a.in_time IS NOT NULL)
             FROM people p
             ORDER BY p.identity_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let present: i64 = row.get(2)?;
                Ok(AttendanceSummary {
                    identity_key: row.get(0)?,
                    display_name: row.get(1)?,
                    total_days: total_days as u32,
                    present_days: present as u32,
                    attendance_percentage: percentage(present, total_days),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn percentage(present: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = present as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
