//! External program execution shared by command-backed sources and backends.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::error::{VisionError, VisionResult};

/// Placeholder replaced with the input file path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

fn default_timeout_ms() -> u64 {
    10_000
}

/// An external program invocation.
///
/// Any argument equal to or containing `{input}` receives the input image
/// path. If no argument mentions it and an input is given, the path is
/// appended as the last argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Arguments with the input path substituted.
    pub fn render_args(&self, input: Option<&Path>) -> Vec<String> {
        let Some(input) = input else {
            return self.args.clone();
        };
        let path = input.display().to_string();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(INPUT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(INPUT_PLACEHOLDER, &path)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(path);
        }
        args
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Run `spec` to completion within its timeout.
///
/// The child is killed if the timeout fires. A non-zero exit is an error.
pub async fn run_command(spec: &CommandSpec, input: Option<&Path>) -> VisionResult<CommandOutput> {
    if spec.program.is_empty() {
        return Err(VisionError::Spawn {
            program: String::new(),
            reason: "empty program".to_string(),
        });
    }

    let start = Instant::now();
    let child = Command::new(&spec.program)
        .args(spec.render_args(input))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| VisionError::Spawn {
            program: spec.program.clone(),
            reason: err.to_string(),
        })?;

    let output = tokio::time::timeout(Duration::from_millis(spec.timeout_ms), child.wait_with_output())
        .await
        .map_err(|_| VisionError::Timeout {
            program: spec.program.clone(),
            timeout_ms: spec.timeout_ms,
        })??;

    let duration_ms = start.elapsed().as_millis() as u64;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    debug!(program = %spec.program, duration_ms, status = ?output.status.code(), "external command finished");

    if !output.status.success() {
        return Err(VisionError::CommandFailed {
            program: spec.program.clone(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr,
        duration_ms,
    })
}

/// Encode `image` as PNG into a temp file that lives as long as the handle.
pub async fn write_temp_png(image: DynamicImage) -> VisionResult<NamedTempFile> {
    tokio::task::spawn_blocking(move || -> VisionResult<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("gatekeeper-")
            .suffix(".png")
            .tempfile()?;
        image.save_with_format(file.path(), ImageFormat::Png)?;
        Ok(file)
    })
    .await
    .map_err(|err| VisionError::Worker(err.to_string()))?
}
