//! Attendance ledger: one record per (identity, day) and its state machine.
//!
//! ```text
//! InOut:          NoRecord ──IN──▶ InOnly ──OUT──▶ Complete ──▶ Complete (ALREADY_MARKED)
//! SinglePresent:  NoRecord ──PRESENT──▶ Present ──▶ Present (ALREADY_MARKED)
//! ```
//!
//! The transition table lives in [`decide`]; storage backends only supply an
//! atomic read-decide-write scope around it.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Status flag written in single-event mode.
pub const PRESENT_STATUS: &str = "Present";

/// Which ledger shape a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerMode {
    /// First authentication of the day records IN, the second records OUT.
    #[default]
    InOut,
    /// One authentication per day marks the person present.
    SinglePresent,
}

/// Result of a `record` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceOutcome {
    In,
    Out,
    Present,
    AlreadyMarked,
}

impl AttendanceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceOutcome::In => "IN",
            AttendanceOutcome::Out => "OUT",
            AttendanceOutcome::Present => "PRESENT",
            AttendanceOutcome::AlreadyMarked => "ALREADY_MARKED",
        }
    }

    /// Whether this outcome wrote to the ledger.
    pub fn is_mutation(self) -> bool {
        !matches!(self, AttendanceOutcome::AlreadyMarked)
    }
}

impl fmt::Display for AttendanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(outcome, timestamp)` returned by the ledger; `timestamp` is `None` for
/// `AlreadyMarked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub outcome: AttendanceOutcome,
    pub timestamp: Option<NaiveDateTime>,
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_key: String,
    pub display_name: String,
    pub date: NaiveDate,
    /// IN time, or the single event time in `SinglePresent` mode.
    pub in_time: Option<NaiveDateTime>,
    pub out_time: Option<NaiveDateTime>,
    /// Set to [`PRESENT_STATUS`] in `SinglePresent` mode.
    pub status: Option<String>,
}

/// State of one (identity, day) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    NoRecord,
    InOnly,
    Complete,
    Present,
}

impl SlotState {
    /// Classify an existing row (or its absence) under `mode`.
    ///
    /// In `SinglePresent` mode any existing row counts as present.
    pub fn of(mode: LedgerMode, record: Option<&AttendanceRecord>) -> Self {
        match (mode, record) {
            (_, None) => SlotState::NoRecord,
            (LedgerMode::SinglePresent, Some(_)) => SlotState::Present,
            (LedgerMode::InOut, Some(r)) if r.out_time.is_none() => SlotState::InOnly,
            (LedgerMode::InOut, Some(_)) => SlotState::Complete,
        }
    }
}

/// What a backend must write for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    /// Insert a new row with `in_time = now`.
    InsertIn,
    /// Insert a new row with `in_time = now` and the present status.
    InsertPresent,
    /// Set `out_time = now` on the existing row.
    SetOut,
    Nothing,
}

/// The transition table.
pub fn decide(mode: LedgerMode, state: SlotState) -> (AttendanceOutcome, LedgerWrite) {
    match (mode, state) {
        (LedgerMode::InOut, SlotState::NoRecord) => (AttendanceOutcome::In, LedgerWrite::InsertIn),
        (LedgerMode::InOut, SlotState::InOnly) => (AttendanceOutcome::Out, LedgerWrite::SetOut),
        (LedgerMode::SinglePresent, SlotState::NoRecord) => {
            (AttendanceOutcome::Present, LedgerWrite::InsertPresent)
        }
        _ => (AttendanceOutcome::AlreadyMarked, LedgerWrite::Nothing),
    }
}

impl LedgerWrite {
    /// Apply this write to an in-memory slot.
    pub fn apply(
        self,
        slot: &mut Option<AttendanceRecord>,
        identity_key: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) {
        match self {
            LedgerWrite::InsertIn | LedgerWrite::InsertPresent => {
                *slot = Some(AttendanceRecord {
                    identity_key: identity_key.to_string(),
                    display_name: display_name.to_string(),
                    date: now.date(),
                    in_time: Some(now),
                    out_time: None,
                    status: (self == LedgerWrite::InsertPresent).then(|| PRESENT_STATUS.to_string()),
                });
            }
            LedgerWrite::SetOut => {
                if let Some(record) = slot.as_mut() {
                    record.out_time = Some(now);
                }
            }
            LedgerWrite::Nothing => {}
        }
    }
}

/// Build the `(outcome, timestamp)` pair for a decided transition.
pub fn entry_for(outcome: AttendanceOutcome, now: NaiveDateTime) -> LedgerEntry {
    LedgerEntry {
        outcome,
        timestamp: outcome.is_mutation().then_some(now),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
}

/// Per-day attendance ledger.
///
/// `record` must perform read-decide-write atomically for the
/// (identity_key, day) slot: concurrent callers for the same slot observe
/// each other's writes, and the loser gets `AlreadyMarked` (or `Out`) rather
/// than a second insert.
pub trait AttendanceLedger {
    fn mode(&self) -> LedgerMode;

    fn record(
        &self,
        identity_key: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) -> Result<LedgerEntry, LedgerError>;

    fn get(&self, identity_key: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, LedgerError>;
}

/// Process-local ledger; one mutex covers every slot.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    mode: LedgerMode,
    slots: Mutex<HashMap<(String, NaiveDate), AttendanceRecord>>,
}

impl MemoryLedger {
    pub fn new(mode: LedgerMode) -> Self {
        Self {
            mode,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttendanceLedger for MemoryLedger {
    fn mode(&self) -> LedgerMode {
        self.mode
    }

    fn record(
        &self,
        identity_key: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let key = (identity_key.to_string(), now.date());

        let mut slot = slots.remove(&key);
        let (outcome, write) = decide(self.mode, SlotState::of(self.mode, slot.as_ref()));
        write.apply(&mut slot, identity_key, display_name, now);
        if let Some(record) = slot {
            slots.insert(key, record);
        }

        Ok(entry_for(outcome, now))
    }

    fn get(&self, identity_key: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, LedgerError> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(&(identity_key.to_string(), date)).cloned())
    }
}
