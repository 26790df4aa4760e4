//! Authentication session: drives frames through liveness, matching and the ledger.
//!
//! All per-session state (frame counter, liveness baseline, last decision)
//! lives on [`AuthenticationSession`], so independent stations can run
//! sessions side by side against shared matchers and ledgers.

use crate::capability::{Clock, EmbedError, FaceEmbedder, FrameSource, SourceError};
use crate::frame::Frame;
use crate::ledger::{AttendanceLedger, AttendanceOutcome, LedgerError};
use crate::liveness::LivenessGate;
use crate::matcher::IdentityMatcher;
use crate::types::MatchResult;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default sampling cadence: every 10th frame is evaluated.
pub const DEFAULT_SAMPLE_EVERY: u64 = 10;

/// When a session stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// Stop after the first accepted identity. An `AlreadyMarked` outcome
    /// also ends the session, though it wrote nothing to the ledger.
    #[default]
    OneShot,
    /// Keep authenticating until cancelled or the source ends.
    Continuous,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Evaluate only frames whose 1-based index is a multiple of this.
    pub sample_every: u64,
    pub termination: Termination,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_every: DEFAULT_SAMPLE_EVERY,
            termination: Termination::OneShot,
        }
    }
}

/// External stop request, checked before and after every frame acquisition.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An accepted identity and the ledger transition it caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedDecision {
    pub identity_key: String,
    pub display_name: String,
    pub outcome: AttendanceOutcome,
    /// `None` when the ledger reported `AlreadyMarked`.
    pub timestamp: Option<NaiveDateTime>,
    pub distance: f32,
}

/// Decision for one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    NoLiveness,
    /// Live, but the embedder found no face (or rejected this frame).
    NoFace,
    Denied { distance: f32 },
    Accepted(AcceptedDecision),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    /// 1-based index of the frame within the session.
    pub frame_index: u64,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Last matcher result, reused for output on frames that are not sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCache {
    pub last_match: MatchResult,
    pub last_match_time: NaiveDateTime,
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Not a sampled frame; carries the cached result for display smoothing.
    Skipped(Option<SessionCache>),
    Evaluated(SessionEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Authenticated(AcceptedDecision),
    Cancelled,
    SourceExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub frames_seen: u64,
    pub frames_sampled: u64,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Embedder(#[from] EmbedError),
}

pub struct AuthenticationSession<'a> {
    config: SessionConfig,
    gate: LivenessGate,
    embedder: &'a mut dyn FaceEmbedder,
    matcher: &'a dyn IdentityMatcher,
    ledger: &'a dyn AttendanceLedger,
    clock: &'a dyn Clock,
    frame_count: u64,
    sampled: u64,
    cache: Option<SessionCache>,
}

impl<'a> AuthenticationSession<'a> {
    /// Start a session. The liveness gate is reset so no baseline carries over
    /// from a previous session.
    pub fn new(
        config: SessionConfig,
        mut gate: LivenessGate,
        embedder: &'a mut dyn FaceEmbedder,
        matcher: &'a dyn IdentityMatcher,
        ledger: &'a dyn AttendanceLedger,
        clock: &'a dyn Clock,
    ) -> Result<Self, SessionError> {
        if config.sample_every == 0 {
            return Err(SessionError::InvalidConfig(
                "sample_every must be at least 1".into(),
            ));
        }
        gate.reset();
        Ok(Self {
            config,
            gate,
            embedder,
            matcher,
            ledger,
            clock,
            frame_count: 0,
            sampled: 0,
            cache: None,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn cache(&self) -> Option<&SessionCache> {
        self.cache.as_ref()
    }

    /// Feed one frame. Ledger failures and a lost embedder are returned as
    /// errors; per-frame embedder failures become [`Decision::NoFace`].
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, SessionError> {
        self.frame_count += 1;
        if self.frame_count % self.config.sample_every != 0 {
            return Ok(FrameOutcome::Skipped(self.cache.clone()));
        }
        self.sampled += 1;

        let decision = self.decide(frame)?;
        Ok(FrameOutcome::Evaluated(SessionEvent {
            frame_index: self.frame_count,
            decision,
        }))
    }

    fn decide(&mut self, frame: &Frame) -> Result<Decision, SessionError> {
        if !self.gate.evaluate(frame)? {
            tracing::debug!(
                frame = self.frame_count,
                score = ?self.gate.last_score(),
                "no liveness"
            );
            return Ok(Decision::NoLiveness);
        }

        let embedding = match self.embedder.embed(frame) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::debug!(frame = self.frame_count, "no face detected");
                return Ok(Decision::NoFace);
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(frame = self.frame_count, error = %e, "embedder lost; ending session");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(frame = self.frame_count, error = %e, "embedding failed; skipping frame");
                return Ok(Decision::NoFace);
            }
        };

        let result = self.matcher.query(&embedding);
        let now = self.clock.now();
        self.cache = Some(SessionCache {
            last_match: result.clone(),
            last_match_time: now,
        });

        let Some(identity_key) = result.identity_key else {
            tracing::info!(frame = self.frame_count, distance = result.distance, "denied");
            return Ok(Decision::Denied {
                distance: result.distance,
            });
        };
        let display_name = result.display_name.unwrap_or_else(|| identity_key.clone());

        let entry = self.ledger.record(&identity_key, &display_name, now)?;
        tracing::info!(
            frame = self.frame_count,
            identity = %identity_key,
            name = %display_name,
            distance = result.distance,
            outcome = %entry.outcome,
            "accepted"
        );

        Ok(Decision::Accepted(AcceptedDecision {
            identity_key,
            display_name,
            outcome: entry.outcome,
            timestamp: entry.timestamp,
            distance: result.distance,
        }))
    }

    /// Pull frames from `source` until the termination policy, the stop
    /// signal, or the end of the source ends the session. `on_event` sees
    /// every sampled-frame decision.
    pub fn run<S, F>(
        &mut self,
        source: &mut S,
        stop: &StopSignal,
        mut on_event: F,
    ) -> Result<SessionReport, SessionError>
    where
        S: FrameSource + ?Sized,
        F: FnMut(&SessionEvent),
    {
        tracing::info!(
            liveness = self.gate.strategy_name(),
            ledger = ?self.ledger.mode(),
            termination = ?self.config.termination,
            sample_every = self.config.sample_every,
            "session started"
        );

        let end = loop {
            if stop.is_stopped() {
                break SessionEnd::Cancelled;
            }
            let Some(frame) = source.next_frame()? else {
                break SessionEnd::SourceExhausted;
            };
            if stop.is_stopped() {
                break SessionEnd::Cancelled;
            }

            let FrameOutcome::Evaluated(event) = self.process_frame(&frame)? else {
                continue;
            };
            on_event(&event);

            if self.config.termination == Termination::OneShot {
                if let Decision::Accepted(accepted) = event.decision {
                    break SessionEnd::Authenticated(accepted);
                }
            }
        };

        tracing::info!(
            end = ?end,
            frames = self.frame_count,
            sampled = self.sampled,
            "session ended"
        );

        Ok(SessionReport {
            end,
            frames_seen: self.frame_count,
            frames_sampled: self.sampled,
        })
    }
}
