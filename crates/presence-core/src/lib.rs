//! presence-core — Authentication decision pipeline for face-based attendance.
//!
//! Liveness gating, nearest-neighbour identity matching over enrolled
//! embeddings, and the per-day attendance state machine. Frame capture,
//! embedding inference and persistence are consumed through traits.

pub mod capability;
pub mod enrollment;
pub mod frame;
pub mod gallery;
pub mod ledger;
pub mod liveness;
pub mod matcher;
pub mod session;
pub mod types;

pub use capability::{Clock, EmbedError, FaceEmbedder, FrameSource, SourceError, SystemClock};
pub use enrollment::{mean_embedding, EnrollmentError, EnrollmentSamples};
pub use frame::{Frame, PixelFormat};
pub use gallery::EmbeddingStore;
pub use ledger::{
    AttendanceLedger, AttendanceOutcome, AttendanceRecord, LedgerEntry, LedgerError, LedgerMode,
    MemoryLedger,
};
pub use liveness::{BlinkConfig, EyeLandmarks, EyeLocator, LivenessGate, LivenessStrategy};
pub use matcher::{IdentityMatcher, LinearScanMatcher};
pub use session::{
    AcceptedDecision, AuthenticationSession, Decision, FrameOutcome, SessionConfig, SessionEnd,
    SessionError, SessionEvent, SessionReport, StopSignal, Termination,
};
pub use types::{Embedding, EnrollmentRecord, MatchResult};
