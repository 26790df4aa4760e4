//! External capabilities the pipeline consumes: frames, embeddings, time.

use crate::frame::Frame;
use crate::types::Embedding;
use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The embedder could not be started.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    /// The embedder rejected this one frame.
    #[error("embedder failed: {0}")]
    Failed(String),
    #[error("embedder protocol error: {0}")]
    Protocol(String),
    /// The embedder went away mid-session; no later frame can succeed.
    #[error("embedder disconnected: {0}")]
    Disconnected(String),
}

impl EmbedError {
    /// Whether the error ends the session rather than just this frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Disconnected(_))
    }
}

/// Face detection + embedding, treated as an opaque model.
pub trait FaceEmbedder {
    /// `Ok(None)` when no face was found in the frame.
    fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>, EmbedError>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("frame source failed: {0}")]
    Failed(String),
}

/// Sequence of frames from a camera or a recording.
pub trait FrameSource {
    /// Block until the next frame is available. `Ok(None)` marks the end of a
    /// finite source.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Local wall-clock time used for ledger timestamps.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// `chrono::Local` wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}
