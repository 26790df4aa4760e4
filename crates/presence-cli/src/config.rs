use presence_core::enrollment::{DEFAULT_CAPTURE_FRAMES, DEFAULT_MIN_VALID_FRAMES};
use presence_core::session::DEFAULT_SAMPLE_EVERY;
use presence_core::{BlinkConfig, LedgerMode, SessionConfig, Termination};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Frame-difference score above which a frame counts as live.
pub const DEFAULT_MOTION_THRESHOLD: f32 = 6.0;
/// Frames read before an enrollment gives up collecting samples.
pub const DEFAULT_ENROLL_MAX_ATTEMPTS: usize = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Liveness strategy selected for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessKind {
    #[default]
    Motion,
    Blink,
}

impl FromStr for LivenessKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "motion" => Ok(Self::Motion),
            "blink" => Ok(Self::Blink),
            _ => Err(()),
        }
    }
}

fn parse_ledger_mode(s: &str) -> Option<LedgerMode> {
    match s {
        "in-out" => Some(LedgerMode::InOut),
        "single-present" => Some(LedgerMode::SinglePresent),
        _ => None,
    }
}

fn parse_termination(s: &str) -> Option<Termination> {
    match s {
        "one-shot" => Some(Termination::OneShot),
        "continuous" => Some(Termination::Continuous),
        _ => None,
    }
}

/// Optional settings read from the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    embeddings_dir: Option<PathBuf>,
    embedder_command: Option<Vec<String>>,
    match_threshold: Option<f32>,
    sample_every: Option<u64>,
    liveness: Option<LivenessKind>,
    motion_threshold: Option<f32>,
    blink_close_ratio: Option<f32>,
    blink_open_ratio: Option<f32>,
    blink_min_closed_frames: Option<usize>,
    blink_window_frames: Option<usize>,
    ledger_mode: Option<LedgerMode>,
    termination: Option<Termination>,
    enroll_capture_frames: Option<usize>,
    enroll_min_valid_frames: Option<usize>,
    enroll_max_attempts: Option<usize>,
}

/// CLI configuration: defaults, then the TOML file, then `PRESENCE_*` variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub data_dir: PathBuf,
    /// SQLite database holding enrollments and attendance.
    pub db_path: PathBuf,
    /// Directory of per-identity embedding files.
    pub embeddings_dir: PathBuf,
    /// Program and arguments of the embedding helper.
    pub embedder_command: Option<Vec<String>>,
    /// Euclidean distance below which a match is accepted. No default: it
    /// depends on the embedding model.
    pub match_threshold: Option<f32>,
    pub sample_every: u64,
    pub liveness: LivenessKind,
    pub motion_threshold: f32,
    pub blink_close_ratio: f32,
    pub blink_open_ratio: f32,
    pub blink_min_closed_frames: usize,
    pub blink_window_frames: usize,
    pub ledger_mode: LedgerMode,
    pub termination: Termination,
    pub enroll_capture_frames: usize,
    pub enroll_min_valid_frames: usize,
    pub enroll_max_attempts: usize,
}

impl Config {
    /// Load from the process environment and an optional config file.
    ///
    /// The file is `path` if given, else `$PRESENCE_CONFIG` if set.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an injectable environment lookup.
    pub fn load_with<E>(path: Option<&Path>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| env("PRESENCE_CONFIG").map(PathBuf::from));

        let file = match &config_path {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        let data_dir = env("PRESENCE_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let blink = BlinkConfig::default();

        let config = Self {
            camera_device: env("PRESENCE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&env, "PRESENCE_FRAME_WIDTH")?
                .or(file.frame_width)
                .unwrap_or(640),
            frame_height: env_parse(&env, "PRESENCE_FRAME_HEIGHT")?
                .or(file.frame_height)
                .unwrap_or(480),
            db_path: env("PRESENCE_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            embeddings_dir: env("PRESENCE_EMBEDDINGS_DIR")
                .map(PathBuf::from)
                .or(file.embeddings_dir)
                .unwrap_or_else(|| data_dir.join("embeddings")),
            data_dir,
            embedder_command: env("PRESENCE_EMBEDDER_COMMAND")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .or(file.embedder_command),
            match_threshold: env_parse(&env, "PRESENCE_MATCH_THRESHOLD")?.or(file.match_threshold),
            sample_every: env_parse(&env, "PRESENCE_SAMPLE_EVERY")?
                .or(file.sample_every)
                .unwrap_or(DEFAULT_SAMPLE_EVERY),
            liveness: env_with(&env, "PRESENCE_LIVENESS", |v| v.parse::<LivenessKind>().ok())?
                .or(file.liveness)
                .unwrap_or_default(),
            motion_threshold: env_parse(&env, "PRESENCE_MOTION_THRESHOLD")?
                .or(file.motion_threshold)
                .unwrap_or(DEFAULT_MOTION_THRESHOLD),
            blink_close_ratio: file.blink_close_ratio.unwrap_or(blink.close_ratio),
            blink_open_ratio: file.blink_open_ratio.unwrap_or(blink.open_ratio),
            blink_min_closed_frames: file
                .blink_min_closed_frames
                .unwrap_or(blink.min_closed_frames),
            blink_window_frames: file.blink_window_frames.unwrap_or(blink.window_frames),
            ledger_mode: env_with(&env, "PRESENCE_LEDGER_MODE", parse_ledger_mode)?
                .or(file.ledger_mode)
                .unwrap_or_default(),
            termination: env_with(&env, "PRESENCE_TERMINATION", parse_termination)?
                .or(file.termination)
                .unwrap_or_default(),
            enroll_capture_frames: file.enroll_capture_frames.unwrap_or(DEFAULT_CAPTURE_FRAMES),
            enroll_min_valid_frames: file
                .enroll_min_valid_frames
                .unwrap_or(DEFAULT_MIN_VALID_FRAMES),
            enroll_max_attempts: file
                .enroll_max_attempts
                .unwrap_or(DEFAULT_ENROLL_MAX_ATTEMPTS),
        };

        if let Some(path) = &config_path {
            tracing::debug!(path = %path.display(), "config file loaded");
        }
        Ok(config)
    }

    /// Check field ranges. Presence of the threshold and embedder command is
    /// checked by the commands that need them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if let Some(t) = self.match_threshold {
            if !(t.is_finite() && t > 0.0) {
                return invalid(format!("match_threshold must be a positive number, got {t}"));
            }
        }
        if self.sample_every == 0 {
            return invalid("sample_every must be at least 1".into());
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return invalid("frame_width and frame_height must be non-zero".into());
        }
        if !(self.motion_threshold.is_finite() && self.motion_threshold >= 0.0) {
            return invalid(format!(
                "motion_threshold must be non-negative, got {}",
                self.motion_threshold
            ));
        }
        if self.blink_close_ratio >= self.blink_open_ratio {
            return invalid(format!(
                "blink_close_ratio ({}) must be below blink_open_ratio ({})",
                self.blink_close_ratio, self.blink_open_ratio
            ));
        }
        if self.blink_window_frames == 0 {
            return invalid("blink_window_frames must be at least 1".into());
        }
        if self.enroll_capture_frames == 0 {
            return invalid("enroll_capture_frames must be at least 1".into());
        }
        if self.enroll_min_valid_frames > self.enroll_capture_frames {
            return invalid(format!(
                "enroll_min_valid_frames ({}) exceeds enroll_capture_frames ({})",
                self.enroll_min_valid_frames, self.enroll_capture_frames
            ));
        }
        if self.enroll_max_attempts < self.enroll_capture_frames {
            return invalid(format!(
                "enroll_max_attempts ({}) is below enroll_capture_frames ({})",
                self.enroll_max_attempts, self.enroll_capture_frames
            ));
        }
        if let Some(cmd) = &self.embedder_command {
            if cmd.is_empty() {
                return invalid("embedder_command must not be empty".into());
            }
        }
        Ok(())
    }

    /// Acceptance threshold; required for authentication.
    pub fn match_threshold(&self) -> Result<f32, ConfigError> {
        self.match_threshold.ok_or_else(|| {
            ConfigError::Invalid(
                "match_threshold is not set (PRESENCE_MATCH_THRESHOLD or config file)".into(),
            )
        })
    }

    /// Embedding helper command; required for camera commands.
    pub fn embedder_command(&self) -> Result<&[String], ConfigError> {
        match self.embedder_command.as_deref() {
            Some(cmd) if !cmd.is_empty() => Ok(cmd),
            _ => Err(ConfigError::Invalid(
                "embedder_command is not set (PRESENCE_EMBEDDER_COMMAND or config file)".into(),
            )),
        }
    }

    pub fn blink_config(&self) -> BlinkConfig {
        BlinkConfig {
            close_ratio: self.blink_close_ratio,
            open_ratio: self.blink_open_ratio,
            min_closed_frames: self.blink_min_closed_frames,
            window_frames: self.blink_window_frames,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            sample_every: self.sample_every,
            termination: self.termination,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir<E: Fn(&str) -> Option<String>>(env: &E) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_with<E, T>(env: &E, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    match env(key) {
        None => Ok(None),
        Some(value) => match parse(value.trim()) {
            Some(v) => Ok(Some(v)),
            None => Err(ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        },
    }
}

fn env_parse<E, T>(env: &E, key: &str) -> Result<Option<T>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
    T: FromStr,
{
    env_with(env, key, |v| v.parse().ok())
}
