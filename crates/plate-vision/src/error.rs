//! Error types for plate-vision

use thiserror::Error;

/// Errors from frame acquisition, detection and text recognition.
#[derive(Error, Debug)]
pub enum VisionError {
    /// No frame could be produced
    #[error("frame unavailable from {source_name}: {reason}")]
    FrameUnavailable { source_name: String, reason: String },

    /// Image bytes could not be decoded or encoded
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// Local I/O failed (temp files, reads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External program could not be started
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// External program exceeded its time budget
    #[error("{program} timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    /// External program exited unsuccessfully
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Backend output could not be parsed
    #[error("malformed output from {backend}: {reason}")]
    MalformedOutput { backend: String, reason: String },

    /// Every recognition backend failed for one candidate
    #[error("all text backends failed: {}", .0.join("; "))]
    AllBackendsFailed(Vec<String>),

    /// Plate pattern did not compile
    #[error("invalid plate pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Configuration values are out of range
    #[error("invalid vision config: {0}")]
    InvalidConfig(String),

    /// Blocking worker panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Result type for vision operations.
pub type VisionResult<T> = std::result::Result<T, VisionError>;
