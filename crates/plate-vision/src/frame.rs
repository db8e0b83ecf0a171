//! Frames and where they come from.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::command::{run_command, CommandSpec};
use crate::error::{VisionError, VisionResult};

/// One captured image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            sequence,
        }
    }

    /// Decode any supported encoding (PNG, JPEG) into an RGB frame.
    pub fn decode(bytes: &[u8], sequence: u64) -> VisionResult<Self> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        Ok(Self::new(image, sequence))
    }

    /// [`Frame::decode`] on the blocking pool, off the async workers.
    pub async fn decode_blocking(
        bytes: impl AsRef<[u8]> + Send + 'static,
        sequence: u64,
    ) -> VisionResult<Self> {
        tokio::task::spawn_blocking(move || Self::decode(bytes.as_ref(), sequence))
            .await
            .map_err(|err| VisionError::Worker(err.to_string()))?
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Produces frames on demand.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn next_frame(&self) -> VisionResult<Frame>;

    /// Human-readable source name for logs.
    fn describe(&self) -> String;
}

/// Re-reads one image file per frame (a snapshot path a camera keeps updating,
/// or a single uploaded image).
pub struct ImageFileSource {
    path: PathBuf,
    sequence: AtomicU64,
}

impl ImageFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl FrameSource for ImageFileSource {
    async fn next_frame(&self) -> VisionResult<Frame> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| VisionError::FrameUnavailable {
                source_name: self.describe(),
                reason: err.to_string(),
            })?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Frame::decode_blocking(bytes, sequence).await.map_err(|err| VisionError::FrameUnavailable {
            source_name: self.describe(),
            reason: err.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Encoded image bytes received with a request; decoded on every read.
pub struct EncodedFrameSource {
    bytes: Arc<[u8]>,
    sequence: AtomicU64,
}

impl EncodedFrameSource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl FrameSource for EncodedFrameSource {
    async fn next_frame(&self) -> VisionResult<Frame> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Frame::decode_blocking(Arc::clone(&self.bytes), sequence)
            .await
            .map_err(|err| VisionError::FrameUnavailable {
                source_name: self.describe(),
                reason: err.to_string(),
            })
    }

    fn describe(&self) -> String {
        format!("request image ({} bytes)", self.bytes.len())
    }
}

/// Runs a snapshot command (e.g. `ffmpeg ... -frames:v 1 -f image2pipe -`)
/// and decodes its stdout.
pub struct CommandFrameSource {
    spec: CommandSpec,
    sequence: AtomicU64,
}

impl CommandFrameSource {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            sequence: AtomicU64::new(0),
        }
    }

    /// Single-frame grab from a V4L2 device or stream URL via ffmpeg.
    pub fn ffmpeg(input: impl Into<String>) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(input.into()))
        .chain(
            ["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"]
                .iter()
                .map(|s| s.to_string()),
        )
        .collect();
        Self::new(CommandSpec::new("ffmpeg", args).with_timeout_ms(5_000))
    }
}

#[async_trait]
impl FrameSource for CommandFrameSource {
    async fn next_frame(&self) -> VisionResult<Frame> {
        let output = run_command(&self.spec, None).await?;
        if output.stdout.is_empty() {
            return Err(VisionError::FrameUnavailable {
                source_name: self.describe(),
                reason: "command produced no image data".to_string(),
            });
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Frame::decode_blocking(output.stdout, sequence).await
    }

    fn describe(&self) -> String {
        self.spec.program.clone()
    }
}

/// Frame source selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameSourceConfig {
    File { path: PathBuf },
    Ffmpeg { input: String },
    Command { command: CommandSpec },
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        FrameSourceConfig::Ffmpeg {
            input: "/dev/video0".to_string(),
        }
    }
}

impl FrameSourceConfig {
    pub fn build(&self) -> Arc<dyn FrameSource> {
        match self {
            FrameSourceConfig::File { path } => Arc::new(ImageFileSource::new(path.clone())),
            FrameSourceConfig::Ffmpeg { input } => Arc::new(CommandFrameSource::ffmpeg(input.clone())),
            FrameSourceConfig::Command { command } => Arc::new(CommandFrameSource::new(command.clone())),
        }
    }
}
