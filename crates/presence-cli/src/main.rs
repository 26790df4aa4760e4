use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use presence_core::{Decision, LedgerMode, SessionEnd, SessionEvent, StopSignal, Termination};
use presence_hw::Camera;
use presence_store::{EnrollmentRepository, RecordFilter, Reports};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod embedder;
mod engine;

use config::Config;

#[derive(Parser)]
#[command(name = "presence", about = "Face-authenticated attendance")]
struct Cli {
    /// TOML config file (default: $PRESENCE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    InOut,
    SinglePresent,
}

impl From<ModeArg> for LedgerMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::InOut => LedgerMode::InOut,
            ModeArg::SinglePresent => LedgerMode::SinglePresent,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and enroll a face under an identity key
    Enroll {
        /// Identity key (e.g., registration number)
        #[arg(long)]
        id: String,
        /// Display name recorded with attendance
        #[arg(long)]
        name: String,
    },
    /// Run an authentication session on the camera
    Authenticate {
        /// Ledger mode (overrides config)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Keep authenticating until interrupted
        #[arg(long, conflicts_with = "one_shot")]
        continuous: bool,
        /// Stop after the first accepted identity
        #[arg(long)]
        one_shot: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity key to remove
        id: String,
    },
    /// Show attendance records, newest first
    Records {
        /// Only this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Only this identity key
        #[arg(long)]
        id: Option<String>,
    },
    /// Attendance percentage per identity
    Summary,
    /// Show configuration, storage and camera status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { id, name } => {
            config.validate()?;
            enroll(config, id, name).await?;
        }
        Commands::Authenticate {
            mode,
            continuous,
            one_shot,
            json,
        } => {
            if let Some(mode) = mode {
                config.ledger_mode = mode.into();
            }
            if continuous {
                config.termination = Termination::Continuous;
            } else if one_shot {
                config.termination = Termination::OneShot;
            }
            config.validate()?;
            authenticate(config, json).await?;
        }
        Commands::List => {
            let repo = open_repository(&config)?;
            let enrolled = repo.list()?;
            println!("{}", serde_json::to_string_pretty(&enrolled)?);
        }
        Commands::Remove { id } => {
            let repo = open_repository(&config)?;
            if repo.remove(&id)? {
                println!("Removed {id}");
            } else {
                anyhow::bail!("{id} is not enrolled");
            }
        }
        Commands::Records { date, id } => {
            let reports = open_reports(&config)?;
            let rows = reports.records(&RecordFilter {
                date,
                identity_key: id,
            })?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Summary => {
            let reports = open_reports(&config)?;
            println!("{}", serde_json::to_string_pretty(&reports.summary()?)?);
        }
        Commands::Status => status(&config)?,
    }

    Ok(())
}

fn open_repository(config: &Config) -> Result<EnrollmentRepository> {
    EnrollmentRepository::open(&config.db_path, &config.embeddings_dir)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

fn open_reports(config: &Config) -> Result<Reports> {
    Reports::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

async fn enroll(config: Config, id: String, name: String) -> Result<()> {
    let stop = StopSignal::new();
    let mut done = engine::spawn_enrollment(config, id, name, stop.clone())?;
    println!("Look at the camera...");

    let result = tokio::select! {
        result = &mut done => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; cancelling enrollment");
            stop.stop();
            done.await
        }
    };
    let enrolled = result.map_err(|_| engine::EngineError::ChannelClosed)??;

    println!(
        "Enrolled {} ({}), {}-dimensional embedding",
        enrolled.identity_key, enrolled.display_name, enrolled.dimension
    );
    Ok(())
}

async fn authenticate(config: Config, json: bool) -> Result<()> {
    let stop = StopSignal::new();
    let mut handle = engine::spawn_session(config, stop.clone())?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(event) => {
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else if let Some(line) = describe_event(&event) {
                        println!("{line}");
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                tracing::info!("interrupt received; stopping session");
                stop.stop();
            }
        }
    }

    let report = handle.finish().await?;
    match &report.end {
        SessionEnd::Authenticated(accepted) => println!(
            "Session complete: {} ({}) {}",
            accepted.identity_key, accepted.display_name, accepted.outcome
        ),
        SessionEnd::Cancelled => println!("Session cancelled"),
        SessionEnd::SourceExhausted => println!("Camera stream ended"),
    }
    println!(
        "{} frames seen, {} evaluated",
        report.frames_seen, report.frames_sampled
    );
    Ok(())
}

/// One status line per sampled-frame decision. Frames without a face are
/// not printed.
fn describe_event(event: &SessionEvent) -> Option<String> {
    let frame = event.frame_index;
    match &event.decision {
        Decision::NoLiveness => Some(format!("frame {frame}: no liveness detected")),
        Decision::NoFace => None,
        Decision::Denied { distance } => {
            Some(format!("frame {frame}: unknown face (distance {distance:.3})"))
        }
        Decision::Accepted(accepted) => {
            let at = accepted
                .timestamp
                .map(|t| format!(" at {}", t.format("%H:%M:%S")))
                .unwrap_or_default();
            Some(format!(
                "frame {frame}: {} ({}) {}{at} (distance {:.3})",
                accepted.identity_key, accepted.display_name, accepted.outcome, accepted.distance
            ))
        }
    }
}

fn status(config: &Config) -> Result<()> {
    let repo = open_repository(config)?;
    let enrolled = repo.list()?.len();
    let today = chrono::Local::now().date_naive();
    let today_records = open_reports(config)?
        .records(&RecordFilter {
            date: Some(today),
            identity_key: None,
        })?
        .len();
    let cameras: Vec<String> = Camera::list_devices()
        .into_iter()
        .map(|d| format!("{} ({}, {})", d.path, d.name, d.driver))
        .collect();

    let status = serde_json::json!({
        "config": config,
        "config_valid": config.validate().err().map(|e| e.to_string()).unwrap_or_else(|| "ok".into()),
        "enrolled": enrolled,
        "records_today": today_records,
        "cameras": cameras,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::session::AcceptedDecision;
    use presence_core::AttendanceOutcome;

    #[test]
    fn test_describe_event() {
        let event = |decision| SessionEvent {
            frame_index: 20,
            decision,
        };

        assert_eq!(describe_event(&event(Decision::NoFace)), None);
        assert_eq!(
            describe_event(&event(Decision::NoLiveness)).unwrap(),
            "frame 20: no liveness detected"
        );
        assert_eq!(
            describe_event(&event(Decision::Denied { distance: 7.25 })).unwrap(),
            "frame 20: unknown face (distance 7.250)"
        );

        let timestamp = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(8, 0, 1)
            .unwrap();
        let accepted = |outcome, timestamp| {
            Decision::Accepted(AcceptedDecision {
                identity_key: "S1".into(),
                display_name: "Ann".into(),
                outcome,
                timestamp,
                distance: 0.5,
            })
        };
        assert_eq!(
            describe_event(&event(accepted(AttendanceOutcome::In, Some(timestamp)))).unwrap(),
            "frame 20: S1 (Ann) IN at 08:00:01 (distance 0.500)"
        );
        assert_eq!(
            describe_event(&event(accepted(AttendanceOutcome::AlreadyMarked, None))).unwrap(),
            "frame 20: S1 (Ann) ALREADY_MARKED (distance 0.500)"
        );
    }

    #[test]
    fn test_cli_parses_authenticate_flags() {
        let cli = Cli::try_parse_from([
            "presence",
            "authenticate",
            "--mode",
            "single-present",
            "--continuous",
        ])
        .unwrap();
        match cli.command {
            Commands::Authenticate {
                mode, continuous, ..
            } => {
                assert!(matches!(mode, Some(ModeArg::SinglePresent)));
                assert!(continuous);
            }
            _ => panic!("expected authenticate"),
        }

        assert!(Cli::try_parse_from(["presence", "authenticate", "--continuous", "--one-shot"]).is_err());
    }

    #[test]
    fn test_cli_parses_records_date() {
        let cli = Cli::try_parse_from(["presence", "records", "--date", "2026-03-02", "--id", "S1"])
            .unwrap();
        match cli.command {
            Commands::Records { date, id } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 2));
                assert_eq!(id.as_deref(), Some("S1"));
            }
            _ => panic!("expected records"),
        }
        assert!(Cli::try_parse_from(["presence", "records", "--date", "yesterday"]).is_err());
    }
}
