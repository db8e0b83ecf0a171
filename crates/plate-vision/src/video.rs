//! Recorded video as a frame source.
//!
//! Every `frame_skip`-th frame (1-based numbers `skip`, `2 * skip`, ...) is
//! grabbed with one bounded ffmpeg run. The source ends the first time the
//! grab produces no image data.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::command::{run_command, CommandSpec};
use crate::error::{VisionError, VisionResult};
use crate::frame::{Frame, FrameSource};

/// Placeholder replaced with the zero-based frame index to grab.
pub const INDEX_PLACEHOLDER: &str = "{index}";

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Reads frames out of a video file at a fixed stride.
pub struct VideoFileSource {
    path: PathBuf,
    frame_skip: u64,
    grab: CommandSpec,
    taken: AtomicU64,
    last_frame: AtomicU64,
    finished: AtomicBool,
}

impl VideoFileSource {
    /// ffmpeg-backed source; `frame_skip` of 0 is treated as 1.
    pub fn new(path: impl Into<PathBuf>, frame_skip: u64) -> Self {
        let grab = CommandSpec::new(
            "ffmpeg",
            strings(&[
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "{input}",
                "-vf",
                "select=eq(n\\,{index})",
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "png",
                "-",
            ]),
        )
        .with_timeout_ms(30_000);
        Self::with_grab_command(path, frame_skip, grab)
    }

    /// Source with a custom grab command. `{input}` receives the video path
    /// and `{index}` the zero-based frame index; the command prints one
    /// encoded image, or nothing past the end.
    pub fn with_grab_command(path: impl Into<PathBuf>, frame_skip: u64, grab: CommandSpec) -> Self {
        Self {
            path: path.into(),
            frame_skip: frame_skip.max(1),
            grab,
            taken: AtomicU64::new(0),
            last_frame: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn frame_skip(&self) -> u64 {
        self.frame_skip
    }

    /// True once the end of the video has been reached.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 1-based number of the last frame handed out; 0 before the first.
    pub fn last_frame_number(&self) -> u64 {
        self.last_frame.load(Ordering::SeqCst)
    }

    /// Frame rate of the first video stream, via ffprobe.
    pub async fn frame_rate(&self) -> VisionResult<f64> {
        let query = CommandSpec::new(
            "ffprobe",
            strings(&[
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=r_frame_rate",
                "-of",
                "csv=p=0",
                "{input}",
            ]),
        )
        .with_timeout_ms(5_000);
        let output = run_command(&query, Some(&self.path)).await?;
        let raw = output.stdout_text();
        parse_frame_rate(&raw).ok_or_else(|| VisionError::MalformedOutput {
            backend: "ffprobe".to_string(),
            reason: format!("unusable frame rate {:?}", raw.trim()),
        })
    }

    fn end_of_video(&self) -> VisionError {
        VisionError::FrameUnavailable {
            source_name: self.describe(),
            reason: "end of video".to_string(),
        }
    }
}

/// Parse ffprobe's `num/den` (or plain number) frame rate.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.lines().next()?.trim();
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => raw.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

#[async_trait]
impl FrameSource for VideoFileSource {
    async fn next_frame(&self) -> VisionResult<Frame> {
        if self.finished() {
            return Err(self.end_of_video());
        }
        let number = (self.taken.fetch_add(1, Ordering::SeqCst) + 1) * self.frame_skip;
        let index = (number - 1).to_string();

        let mut grab = self.grab.clone();
        grab.args = grab
            .args
            .iter()
            .map(|arg| arg.replace(INDEX_PLACEHOLDER, &index))
            .collect();
        let output = run_command(&grab, Some(&self.path)).await?;
        if output.stdout.is_empty() {
            debug!(video = %self.describe(), frame = number, "end of video");
            self.finished.store(true, Ordering::SeqCst);
            return Err(self.end_of_video());
        }

        let frame = Frame::decode_blocking(output.stdout, number).await?;
        self.last_frame.store(number, Ordering::SeqCst);
        Ok(frame)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
