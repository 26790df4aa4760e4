//! Camera work on a dedicated OS thread.
//!
//! The camera stream, the helper process and the SQLite connections are all
//! blocking, so sessions and enrollments run on their own thread and report
//! back to the async side over tokio channels.

use crate::config::{Config, ConfigError, LivenessKind};
use crate::embedder::HelperEmbedder;
use presence_core::{
    AuthenticationSession, EmbedError, EnrollmentError, EnrollmentSamples, FaceEmbedder,
    FrameSource, LivenessGate, SessionError, SessionEvent, SessionReport, SourceError,
    StopSignal, SystemClock,
};
use presence_hw::{Camera, CameraError};
use presence_store::{
    EnrolledIdentity, EnrollmentRepository, RepositoryMatcher, SqliteLedger, StoreError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Fraction of near-black pixels above which an enrollment frame is skipped.
const DARK_FRAME_FRACTION: f32 = 0.95;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("cancelled")]
    Cancelled,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A session running on the engine thread.
pub struct SessionHandle {
    /// Decisions for sampled frames, in order. Closes when the session ends.
    pub events: mpsc::Receiver<SessionEvent>,
    done: oneshot::Receiver<Result<SessionReport, EngineError>>,
}

impl SessionHandle {
    /// Wait for the session's final report.
    pub async fn finish(self) -> Result<SessionReport, EngineError> {
        self.done.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn an authentication session.
///
/// Resources are opened on the engine thread; a startup failure arrives
/// through [`SessionHandle::finish`].
pub fn spawn_session(config: Config, stop: StopSignal) -> Result<SessionHandle, EngineError> {
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(32);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("presence-session".into())
        .spawn(move || {
            tracing::info!("session thread started");
            let result = run_session(&config, &stop, |event| {
                // A dropped receiver only means nobody is printing events.
                let _ = event_tx.blocking_send(event.clone());
            });
            drop(event_tx);
            let _ = done_tx.send(result);
            tracing::info!("session thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(SessionHandle {
        events: event_rx,
        done: done_rx,
    })
}

fn run_session<F>(config: &Config, stop: &StopSignal, on_event: F) -> Result<SessionReport, EngineError>
where
    F: FnMut(&SessionEvent),
{
    let threshold = config.match_threshold()?;
    let command = config.embedder_command()?;

    let repo = EnrollmentRepository::open(&config.db_path, &config.embeddings_dir)?;
    let matcher = RepositoryMatcher::new(repo, threshold)?;
    if matcher.enrolled() == 0 {
        tracing::warn!("no enrolled identities yet; faces are denied until someone enrolls");
    }
    let ledger = SqliteLedger::open(&config.db_path, config.ledger_mode)?;
    tracing::info!(enrolled = matcher.enrolled(), threshold, "matcher ready");

    let mut embedder = HelperEmbedder::spawn(command)?;
    let gate = match config.liveness {
        LivenessKind::Motion => LivenessGate::motion(config.motion_threshold),
        LivenessKind::Blink => {
            LivenessGate::blink(config.blink_config(), Box::new(embedder.clone()))
        }
    };

    let mut camera =
        Camera::open(&config.camera_device, config.frame_width, config.frame_height)?
            .into_stream()?;

    let clock = SystemClock;
    let mut session = AuthenticationSession::new(
        config.session_config(),
        gate,
        &mut embedder,
        &matcher,
        &ledger,
        &clock,
    )?;
    Ok(session.run(&mut camera, stop, on_event)?)
}

/// Capture and persist an enrollment on the engine thread.
pub fn spawn_enrollment(
    config: Config,
    identity_key: String,
    display_name: String,
    stop: StopSignal,
) -> Result<oneshot::Receiver<Result<EnrolledIdentity, EngineError>>, EngineError> {
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("presence-enroll".into())
        .spawn(move || {
            let result = run_enrollment(&config, &identity_key, &display_name, &stop);
            let _ = done_tx.send(result);
        })
        .map_err(EngineError::Spawn)?;

    Ok(done_rx)
}

fn run_enrollment(
    config: &Config,
    identity_key: &str,
    display_name: &str,
    stop: &StopSignal,
) -> Result<EnrolledIdentity, EngineError> {
    presence_store::validate_identity_key(identity_key)?;
    let repo = EnrollmentRepository::open(&config.db_path, &config.embeddings_dir)?;
    let mut embedder = HelperEmbedder::spawn(config.embedder_command()?)?;
    let mut camera =
        Camera::open(&config.camera_device, config.frame_width, config.frame_height)?
            .into_stream()?;

    let samples = collect_samples(
        &mut camera,
        &mut embedder,
        &CapturePlan {
            capture_frames: config.enroll_capture_frames,
            min_valid_frames: config.enroll_min_valid_frames,
            max_attempts: config.enroll_max_attempts,
        },
        stop,
    )?;
    let record = samples.finish(identity_key, display_name)?;
    Ok(repo.enroll(&record)?)
}

/// Limits for one enrollment capture.
#[derive(Debug, Clone, Copy)]
pub struct CapturePlan {
    /// Stop once this many embeddings are collected.
    pub capture_frames: usize,
    /// Fewer valid embeddings than this fails the enrollment.
    pub min_valid_frames: usize,
    /// Frames read before giving up.
    pub max_attempts: usize,
}

/// Read frames until `capture_frames` embeddings are collected, the source
/// ends, or `max_attempts` frames have been read. Dark frames and frames
/// without a face are skipped; losing the embedder aborts the capture.
pub fn collect_samples<S, E>(
    source: &mut S,
    embedder: &mut E,
    plan: &CapturePlan,
    stop: &StopSignal,
) -> Result<EnrollmentSamples, EngineError>
where
    S: FrameSource + ?Sized,
    E: FaceEmbedder + ?Sized,
{
    let mut samples = EnrollmentSamples::new(plan.min_valid_frames);
    let mut dark = 0usize;
    let mut no_face = 0usize;

    for attempt in 1..=plan.max_attempts {
        if samples.len() >= plan.capture_frames {
            break;
        }
        if stop.is_stopped() {
            return Err(EngineError::Cancelled);
        }
        let Some(frame) = source.next_frame()? else {
            break;
        };

        if presence_hw::is_dark_frame(&frame.intensity(), DARK_FRAME_FRACTION) {
            dark += 1;
            continue;
        }

        match embedder.embed(&frame) {
            Ok(Some(embedding)) => {
                samples.push(embedding);
                tracing::debug!(attempt, collected = samples.len(), "enrollment sample");
            }
            Ok(None) => no_face += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "embedding failed; skipping frame");
                no_face += 1;
            }
        }
    }

    tracing::info!(
        collected = samples.len(),
        dark,
        no_face,
        "enrollment capture finished"
    );
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{Embedding, Frame};

    struct Frames {
        values: Vec<u8>,
    }

    impl FrameSource for Frames {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.values.is_empty() {
                return Ok(None);
            }
            let v = self.values.remove(0);
            Ok(Some(Frame::gray(vec![v; 4], 2, 2).expect("valid frame")))
        }
    }

    /// Finds a face in frames brighter than 100, embedding the brightness.
    struct BrightFace;

    impl FaceEmbedder for BrightFace {
        fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>, EmbedError> {
            let v = frame.data[0];
            if v == 150 {
                return Err(EmbedError::Protocol("bad frame".into()));
            }
            Ok((v > 100).then(|| Embedding::new(vec![f32::from(v), 1.0])))
        }
    }

    fn plan(capture: usize, min: usize, max: usize) -> CapturePlan {
        CapturePlan {
            capture_frames: capture,
            min_valid_frames: min,
            max_attempts: max,
        }
    }

    #[test]
    fn test_collect_stops_at_capture_frames() {
        let mut source = Frames {
            values: vec![200; 50],
        };
        let samples =
            collect_samples(&mut source, &mut BrightFace, &plan(5, 3, 100), &StopSignal::new())
                .unwrap();
        assert_eq!(samples.len(), 5);
        assert_eq!(source.values.len(), 45);
    }

    #[test]
    fn test_collect_skips_dark_faceless_and_failed_frames() {
        let mut source = Frames {
            values: vec![0, 50, 150, 110, 0, 130],
        };
        let samples =
            collect_samples(&mut source, &mut BrightFace, &plan(5, 2, 100), &StopSignal::new())
                .unwrap();
        assert_eq!(samples.len(), 2);

        let record = samples.finish("S1", "Ann").unwrap();
        assert!((record.embedding.values[0] - 120.0).abs() < 1e-4);
    }

    #[test]
    fn test_collect_respects_max_attempts() {
        let mut source = Frames {
            values: vec![50; 40],
        };
        let samples =
            collect_samples(&mut source, &mut BrightFace, &plan(5, 3, 10), &StopSignal::new())
                .unwrap();
        assert!(samples.is_empty());
        assert_eq!(source.values.len(), 30);
        assert!(matches!(
            samples.finish("S1", "Ann"),
            Err(EnrollmentError::InsufficientSamples {
                captured: 0,
                required: 3
            })
        ));
    }

    #[test]
    fn test_collect_cancelled() {
        let stop = StopSignal::new();
        stop.stop();
        let mut source = Frames {
            values: vec![200; 5],
        };
        let err = collect_samples(&mut source, &mut BrightFace, &plan(5, 3, 10), &stop).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    struct LostEmbedder {
        calls: usize,
    }

    impl FaceEmbedder for LostEmbedder {
        fn embed(&mut self, _frame: &Frame) -> Result<Option<Embedding>, EmbedError> {
            self.calls += 1;
            Err(EmbedError::Disconnected("helper closed its output".into()))
        }
    }

    #[test]
    fn test_collect_aborts_when_embedder_is_lost() {
        let mut source = Frames {
            values: vec![200; 20],
        };
        let mut embedder = LostEmbedder { calls: 0 };
        let err = collect_samples(&mut source, &mut embedder, &plan(5, 3, 20), &StopSignal::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Embedder(EmbedError::Disconnected(_))));
        assert_eq!(embedder.calls, 1);
        assert_eq!(source.values.len(), 19);
    }

    #[test]
    fn test_session_requires_threshold() {
        let config = Config::load_with(None, |_| None).unwrap();
        let err = run_session(&config, &StopSignal::new(), |_| {}).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
