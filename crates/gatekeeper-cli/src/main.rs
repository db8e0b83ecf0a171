//! Gatekeeper - camera-driven barrier control CLI
//!
//! The `gatekeeper` command runs the access loop for one gate.
//!
//! ## Commands
//!
//! - `detect`: one capture (from an image file or the configured camera)
//! - `gate`: open or close the barrier directly
//! - `check-plate`: ask the registry about one plate
//! - `watch`: wait for the vehicle sensor and run a capture per trigger
//! - `video`: run captures over a recorded video, logging recognized plates

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gate_actuator::{CommandProtocol, GateActuator, GateState};
use gatekeeper_core::metrics::METRICS;
use gatekeeper_core::{ControlLoop, GatekeeperConfig, GatekeeperError};
use plate_vision::{FrameSource, ImageFileSource, VideoFileSource};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Camera-driven barrier control", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults plus environment overrides when omitted)
    #[arg(short, long, global = true, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one capture and print the outcome as JSON
    Detect {
        /// Read frames from this image instead of the configured source
        #[arg(short, long)]
        image: Option<PathBuf>,
    },

    /// Drive the barrier directly
    Gate {
        #[command(subcommand)]
        action: GateAction,
    },

    /// Look up one plate in the configured registry
    CheckPlate {
        /// Plate text as it would be read
        plate: String,
    },

    /// Run captures until interrupted
    Watch {
        /// Capture continuously instead of waiting for the vehicle sensor
        #[arg(long)]
        continuous: bool,

        /// How long to wait for one sensor trigger before waiting again
        #[arg(long, default_value = "30")]
        trigger_timeout_secs: u64,

        /// Pause between captures in continuous mode
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Run one capture per sampled frame of a recorded video
    Video {
        /// Video file readable by ffmpeg
        path: PathBuf,

        /// Sample every Nth frame
        #[arg(long, default_value = "3")]
        frame_skip: u64,

        /// Append one JSON line per recognized plate to this file
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum GateAction {
    /// Open, then wait for the auto-close
    Open,
    /// Close
    Close,
}

#[derive(Debug, Serialize)]
struct WatchSummary {
    captures: u64,
    plates_read: u64,
    grants: u64,
    denials: u64,
    gate_failures: u64,
}

/// One recognized plate from a video run.
#[derive(Debug, Serialize)]
struct PlateLogEntry {
    frame: u64,
    plate: String,
    authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_secs: Option<f64>,
}

/// JSON-lines plate log, flushed per entry.
struct PlateLog {
    out: LineWriter<File>,
}

impl PlateLog {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create plate log {}", path.display()))?;
        Ok(Self {
            out: LineWriter::new(file),
        })
    }

    fn append(&mut self, entry: &PlateLogEntry) -> Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

/// Seconds into the video, to the hundredth.
fn frame_timestamp(frame: u64, fps: Option<f64>) -> Option<f64> {
    fps.map(|fps| (frame as f64 / fps * 100.0).round() / 100.0)
}

/// Consecutive failed grabs before a video run gives up.
const MAX_VIDEO_FAILURES: u32 = 3;

impl WatchSummary {
    fn snapshot() -> Self {
        Self {
            captures: METRICS.captures(),
            plates_read: METRICS.plates_read(),
            grants: METRICS.grants(),
            denials: METRICS.denials(),
            gate_failures: METRICS.gate_failures(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gatekeeper_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Detect { image } => cmd_detect(&config, image.as_deref()).await,
        Commands::Gate { action } => cmd_gate(&config, action).await,
        Commands::CheckPlate { plate } => cmd_check_plate(&config, &plate).await,
        Commands::Watch {
            continuous,
            trigger_timeout_secs,
            interval_ms,
        } => {
            cmd_watch(
                &config,
                continuous,
                Duration::from_secs(trigger_timeout_secs),
                Duration::from_millis(interval_ms),
            )
            .await
        }
        Commands::Video {
            path,
            frame_skip,
            log,
        } => cmd_video(&config, &path, frame_skip, log.as_deref()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<GatekeeperConfig> {
    match path {
        Some(path) => GatekeeperConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => GatekeeperConfig::from_env().context("Invalid configuration"),
    }
}

async fn build_loop(config: &GatekeeperConfig) -> Result<ControlLoop> {
    config
        .build_control_loop()
        .await
        .context("Failed to assemble the access loop")
}

/// Let an open gate run its auto-close, then release the channel.
async fn release_gate(gate: &GateActuator) -> Result<()> {
    if gate.state() == GateState::Open {
        let cfg = gate.config();
        let limit = Duration::from_millis(
            cfg.auto_close_ms + cfg.ack_timeout_ms * u64::from(cfg.max_attempts) + 1000,
        );
        info!(limit_ms = limit.as_millis() as u64, "waiting for auto-close");
        let mut states = gate.watch_state();
        let closed = tokio::time::timeout(limit, states.wait_for(|s| *s == GateState::Closed)).await;
        if !matches!(closed, Ok(Ok(_))) {
            warn!("auto-close not observed; closing on shutdown");
        }
    }
    gate.shutdown().await.context("Gate did not close on shutdown")
}

async fn cmd_detect(config: &GatekeeperConfig, image: Option<&Path>) -> Result<()> {
    let control = build_loop(config).await?;
    let source: Arc<dyn FrameSource> = match image {
        Some(path) => Arc::new(ImageFileSource::new(path)),
        None => config.build_frame_source(),
    };

    let outcome = match control.handle_capture(source.as_ref()).await {
        Ok(outcome) => outcome,
        Err(err @ GatekeeperError::NoFrame { .. }) => {
            control.gate().shutdown().await.ok();
            return Err(err).context("No frame could be read");
        }
        Err(err) => return Err(err).context("Capture failed"),
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    release_gate(control.gate()).await
}

async fn cmd_gate(config: &GatekeeperConfig, action: GateAction) -> Result<()> {
    let control = build_loop(config).await?;
    let response = control.set_gate(matches!(action, GateAction::Open)).await;
    println!("{}", serde_json::to_string(&response)?);
    release_gate(control.gate()).await
}

async fn cmd_check_plate(config: &GatekeeperConfig, plate: &str) -> Result<()> {
    let authorizer = config
        .build_authorizer()
        .context("Failed to build authorization backend")?;
    let timeout = Duration::from_millis(config.control.authorization_timeout_ms);
    info!(registry = %authorizer.describe(), plate = %plate, "checking plate");

    let result = authorizer.lookup(plate, timeout).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Sensor-triggered watching needs a controller that reports vehicles.
fn check_watch_mode(config: &GatekeeperConfig, continuous: bool) -> Result<()> {
    if !continuous && config.actuator.protocol == CommandProtocol::SingleByte {
        anyhow::bail!(
            "the single-byte controller does not report vehicles once enabled; use --continuous"
        );
    }
    Ok(())
}

async fn cmd_watch(
    config: &GatekeeperConfig,
    continuous: bool,
    trigger_timeout: Duration,
    interval: Duration,
) -> Result<()> {
    check_watch_mode(config, continuous)?;
    let control = build_loop(config).await?;
    let source = config.build_frame_source();
    let listener = control.gate().spawn_listener();
    info!(
        source = %source.describe(),
        continuous,
        token = %control.config().trigger_token,
        "watching for vehicles"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let cycle = async {
            if !continuous && !control.wait_for_trigger(trigger_timeout).await {
                return;
            }
            match control.handle_capture(source.as_ref()).await {
                Ok(outcome) => match serde_json::to_string(&outcome) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "cannot serialize outcome"),
                },
                Err(err) => warn!(error = %err, "capture failed"),
            }
            if continuous {
                tokio::time::sleep(interval).await;
            }
        };

        tokio::select! {
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    warn!(error = %err, "signal handler failed");
                }
                info!("interrupted");
                break;
            }
            _ = cycle => {}
        }
    }

    listener.abort();
    METRICS.flush();
    println!("{}", serde_json::to_string(&WatchSummary::snapshot())?);
    control
        .gate()
        .shutdown()
        .await
        .context("Gate did not close on shutdown")
}

async fn cmd_video(
    config: &GatekeeperConfig,
    path: &Path,
    frame_skip: u64,
    log: Option<&Path>,
) -> Result<()> {
    anyhow::ensure!(frame_skip > 0, "--frame-skip must be at least 1");
    anyhow::ensure!(path.exists(), "Video not found: {}", path.display());

    // A sampled frame is never retried: one frame per capture.
    let mut config = config.clone();
    config.control.max_attempts = 1;
    let control = build_loop(&config).await?;

    let source = VideoFileSource::new(path, frame_skip);
    let fps = match source.frame_rate().await {
        Ok(fps) => Some(fps),
        Err(err) => {
            warn!(error = %err, "frame rate unknown; log entries carry no timestamp");
            None
        }
    };
    let mut log = log.map(PlateLog::create).transpose()?;
    info!(video = %path.display(), frame_skip, fps, "processing video");

    let mut failures = 0;
    loop {
        match control.handle_capture(&source).await {
            Ok(outcome) => {
                failures = 0;
                println!("{}", serde_json::to_string(&outcome)?);
                if let (Some(plate), Some(log)) = (&outcome.plate, log.as_mut()) {
                    let frame = source.last_frame_number();
                    log.append(&PlateLogEntry {
                        frame,
                        plate: plate.clone(),
                        authorized: outcome.authorized,
                        timestamp_secs: frame_timestamp(frame, fps),
                    })?;
                }
            }
            Err(_) if source.finished() => break,
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "video frame failed");
                if failures >= MAX_VIDEO_FAILURES {
                    control.gate().shutdown().await.ok();
                    return Err(err).context("Video could not be read");
                }
            }
        }
    }

    info!(last_frame = source.last_frame_number(), "end of video");
    METRICS.flush();
    println!("{}", serde_json::to_string(&WatchSummary::snapshot())?);
    control
        .gate()
        .shutdown()
        .await
        .context("Gate did not close on shutdown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch_flags() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "--json",
            "watch",
            "--continuous",
            "--interval-ms",
            "250",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Watch {
                continuous,
                trigger_timeout_secs,
                interval_ms,
            } => {
                assert!(continuous);
                assert_eq!(trigger_timeout_secs, 30);
                assert_eq!(interval_ms, 250);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_parse_gate_and_check_plate() {
        let cli = Cli::try_parse_from(["gatekeeper", "gate", "open"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Gate {
                action: GateAction::Open
            }
        ));

        let cli = Cli::try_parse_from(["gatekeeper", "check-plate", "KL07CD4321"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckPlate { ref plate } if plate == "KL07CD4321"));
    }

    #[test]
    fn test_parse_video_flags() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "video",
            "gate-cam.mp4",
            "--frame-skip",
            "5",
            "--log",
            "plates.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::Video {
                path,
                frame_skip,
                log,
            } => {
                assert_eq!(path, PathBuf::from("gate-cam.mp4"));
                assert_eq!(frame_skip, 5);
                assert_eq!(log, Some(PathBuf::from("plates.jsonl")));
            }
            _ => panic!("expected video"),
        }

        let cli = Cli::try_parse_from(["gatekeeper", "video", "clip.mp4"]).unwrap();
        assert!(matches!(cli.command, Commands::Video { frame_skip: 3, log: None, .. }));
    }

    #[test]
    fn test_plate_log_writes_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.jsonl");
        let mut log = PlateLog::create(&path).unwrap();
        log.append(&PlateLogEntry {
            frame: 90,
            plate: "ABC123".to_string(),
            authorized: true,
            timestamp_secs: frame_timestamp(90, Some(30.0)),
        })
        .unwrap();
        log.append(&PlateLogEntry {
            frame: 93,
            plate: "XYZ789".to_string(),
            authorized: false,
            timestamp_secs: None,
        })
        .unwrap();
        drop(log);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                serde_json::json!({"frame": 90, "plate": "ABC123", "authorized": true, "timestamp_secs": 3.0}),
                serde_json::json!({"frame": 93, "plate": "XYZ789", "authorized": false}),
            ]
        );
    }

    #[test]
    fn test_frame_timestamp_rounds_to_hundredths() {
        assert_eq!(frame_timestamp(1, Some(29.97)), Some(0.03));
        assert_eq!(frame_timestamp(10, None), None);
    }

    #[tokio::test]
    async fn test_video_rejects_missing_file() {
        let err = cmd_video(
            &GatekeeperConfig::default(),
            Path::new("/nonexistent/clip.mp4"),
            3,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Video not found"));
    }

    #[test]
    fn test_detect_image_is_optional() {
        let cli = Cli::try_parse_from(["gatekeeper", "detect"]).unwrap();
        assert!(matches!(cli.command, Commands::Detect { image: None }));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeeper.json");
        std::fs::write(
            &path,
            r#"{"authorization": {"type": "static", "plates": ["ABC123"]}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.control.max_attempts, 3);
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Some(Path::new("/nonexistent/gatekeeper.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/gatekeeper.json"));
    }

    #[test]
    fn test_watch_mode_requires_continuous_for_single_byte_controller() {
        let config: GatekeeperConfig =
            serde_json::from_str(r#"{"actuator": {"protocol": "single_byte"}}"#).unwrap();
        let err = check_watch_mode(&config, false).unwrap_err();
        assert!(err.to_string().contains("--continuous"));
        assert!(check_watch_mode(&config, true).is_ok());
        assert!(check_watch_mode(&GatekeeperConfig::default(), false).is_ok());
    }

    #[tokio::test]
    async fn test_check_plate_against_static_list() {
        let config: GatekeeperConfig = serde_json::from_str(
            r#"{"authorization": {"type": "static", "plates": ["ABC123"]}}"#,
        )
        .unwrap();
        cmd_check_plate(&config, "ABC-123").await.unwrap();
    }
}
