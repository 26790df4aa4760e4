//! Liveness gating: decides whether a frame shows a live subject.
//!
//! Two strategies share one gate:
//!
//! - **Motion differencing** compares each frame's intensity map against the
//!   previous one. A printed photo held still produces a near-zero score.
//! - **Blink detection** tracks the eye aspect ratio (EAR) of six-point eye
//!   contours and requires a closed→open cycle within a recent window.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static photographs (both strategies); a photo waved in front
//!   of the camera (blink only).
//! - **Does not block:** video replay (motion), replayed blinking video or 3D
//!   masks (blink).

use crate::capability::EmbedError;
use crate::frame::{mean_abs_diff, Frame};

/// Six-point eye contour: corners at indices 0 and 3, upper lid at 1 and 2,
/// lower lid at 5 and 4.
pub type EyeContour = [(f32, f32); 6];

/// Eye contours for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeLandmarks {
    pub left: EyeContour,
    pub right: EyeContour,
}

/// Consumed capability that finds eye contours in a frame.
///
/// `Ok(None)` means no face or no eyes were found; the gate treats that frame
/// as not live. Shares the embedder's error type, since both usually sit on
/// the same model process.
pub trait EyeLocator {
    fn locate(&mut self, frame: &Frame) -> Result<Option<EyeLandmarks>, EmbedError>;
}

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye aspect ratio: mean lid opening over eye width.
///
/// Drops towards zero as the eye closes. Degenerate contours (zero width)
/// return 0.0.
pub fn eye_aspect_ratio(eye: &EyeContour) -> f32 {
    let width = dist(eye[0], eye[3]);
    if width <= f32::EPSILON {
        return 0.0;
    }
    (dist(eye[1], eye[5]) + dist(eye[2], eye[4])) / (2.0 * width)
}

/// Frame-to-frame motion differencing.
#[derive(Debug, Clone)]
pub struct MotionDiff {
    threshold: f32,
    baseline: Option<Vec<u8>>,
}

impl MotionDiff {
    /// `threshold` is the mean absolute intensity difference (0–255 scale)
    /// a frame must exceed to count as live.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            baseline: None,
        }
    }

    /// Score this frame, then store it as the new baseline.
    ///
    /// Returns `None` when there was no comparable baseline (first frame of a
    /// session, or the resolution changed).
    fn observe(&mut self, frame: &Frame) -> Option<f32> {
        let current = frame.intensity();
        let score = self
            .baseline
            .as_deref()
            .and_then(|prev| mean_abs_diff(prev, &current));
        self.baseline = Some(current);
        score
    }

    fn is_live(&self, score: Option<f32>) -> bool {
        matches!(score, Some(s) if s > self.threshold)
    }

    fn reset(&mut self) {
        self.baseline = None;
    }
}

/// Blink detector thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BlinkConfig {
    /// EAR below which the eyes count as closed.
    pub close_ratio: f32,
    /// EAR above which the eyes count as open again. Values between the two
    /// ratios keep the previous state.
    pub open_ratio: f32,
    /// Consecutive closed observations needed before a reopening counts.
    pub min_closed_frames: usize,
    /// Observations after a completed blink during which the gate reports live.
    pub window_frames: usize,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            close_ratio: 0.21,
            open_ratio: 0.25,
            min_closed_frames: 1,
            window_frames: 5,
        }
    }
}

/// Eye-closure/opening cycle detector.
pub struct BlinkDetector {
    config: BlinkConfig,
    locator: Box<dyn EyeLocator + Send>,
    closed_run: usize,
    eyes_closed: bool,
    /// Observations since the last completed blink (0 = this observation).
    since_blink: Option<usize>,
}

impl BlinkDetector {
    pub fn new(config: BlinkConfig, locator: Box<dyn EyeLocator + Send>) -> Self {
        Self {
            config,
            locator,
            closed_run: 0,
            eyes_closed: false,
            since_blink: None,
        }
    }

    fn observe(&mut self, frame: &Frame) -> Result<Option<f32>, EmbedError> {
        if let Some(age) = self.since_blink.as_mut() {
            *age += 1;
        }

        let eyes = match self.locator.locate(frame) {
            Ok(Some(eyes)) => eyes,
            Ok(None) => return Ok(None),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "eye localisation failed");
                return Ok(None);
            }
        };
        let ear = (eye_aspect_ratio(&eyes.left) + eye_aspect_ratio(&eyes.right)) / 2.0;

        if ear < self.config.close_ratio {
            self.closed_run += 1;
            if self.closed_run >= self.config.min_closed_frames {
                self.eyes_closed = true;
            }
        } else if ear > self.config.open_ratio {
            if self.eyes_closed {
                tracing::debug!(ear, "blink completed");
                self.since_blink = Some(0);
            }
            self.eyes_closed = false;
            self.closed_run = 0;
        }

        Ok(Some(ear))
    }

    fn is_live(&self, score: Option<f32>) -> bool {
        score.is_some() && matches!(self.since_blink, Some(age) if age < self.config.window_frames)
    }

    fn reset(&mut self) {
        self.closed_run = 0;
        self.eyes_closed = false;
        self.since_blink = None;
    }
}

/// Liveness strategy selection.
pub enum LivenessStrategy {
    MotionDiff(MotionDiff),
    BlinkDetector(BlinkDetector),
}

impl LivenessStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LivenessStrategy::MotionDiff(_) => "motion",
            LivenessStrategy::BlinkDetector(_) => "blink",
        }
    }
}

/// Session-scoped liveness gate.
pub struct LivenessGate {
    strategy: LivenessStrategy,
    last_score: Option<f32>,
}

impl LivenessGate {
    pub fn new(strategy: LivenessStrategy) -> Self {
        Self {
            strategy,
            last_score: None,
        }
    }

    pub fn motion(threshold: f32) -> Self {
        Self::new(LivenessStrategy::MotionDiff(MotionDiff::new(threshold)))
    }

    pub fn blink(config: BlinkConfig, locator: Box<dyn EyeLocator + Send>) -> Self {
        Self::new(LivenessStrategy::BlinkDetector(BlinkDetector::new(
            config, locator,
        )))
    }

    /// Decide whether `frame` shows a live subject. Updates internal state.
    ///
    /// Fails only when the blink strategy's eye locator is gone for good.
    pub fn evaluate(&mut self, frame: &Frame) -> Result<bool, EmbedError> {
        let (score, live) = match &mut self.strategy {
            LivenessStrategy::MotionDiff(m) => {
                let score = m.observe(frame);
                (score, m.is_live(score))
            }
            LivenessStrategy::BlinkDetector(b) => {
                let score = b.observe(frame)?;
                (score, b.is_live(score))
            }
        };
        tracing::debug!(
            strategy = self.strategy.name(),
            score = ?score,
            live,
            "liveness evaluated"
        );
        self.last_score = score;
        Ok(live)
    }

    /// Drop all history, as at the start of a new session.
    pub fn reset(&mut self) {
        self.last_score = None;
        match &mut self.strategy {
            LivenessStrategy::MotionDiff(m) => m.reset(),
            LivenessStrategy::BlinkDetector(b) => b.reset(),
        }
    }

    /// Score of the most recent evaluation (motion difference or EAR).
    pub fn last_score(&self) -> Option<f32> {
        self.last_score
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}
