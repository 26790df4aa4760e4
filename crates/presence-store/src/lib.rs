//! presence-store — SQLite persistence for enrollments and attendance.
//!
//! One database file holds the `enrollments` and `attendance` tables;
//! embedding vectors live next to it as one JSON file per identity.

pub mod db;
pub mod enrollments;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod report;

pub use enrollments::{validate_identity_key, EnrolledIdentity, EnrollmentRepository, LoadSummary};
pub use error::{StoreError, StoreResult};
pub use ledger::SqliteLedger;
pub use matcher::RepositoryMatcher;
pub use report::{AttendanceSummary, RecordFilter, Reports};
