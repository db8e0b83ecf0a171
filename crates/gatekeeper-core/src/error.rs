//! Error types for gatekeeper-core

use plate_vision::VisionError;
use thiserror::Error;

/// Errors surfaced by the control loop and configuration layer.
///
/// Authorization failures are not errors: they come back as
/// [`crate::AuthorizationResult`] with `authorized = false`. Gate failures
/// come back as `success: false` in [`crate::GateCommandResponse`].
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Not a single frame could be read during a capture
    #[error("no frame could be read after {attempts} attempt(s): {last_error}")]
    NoFrame { attempts: u32, last_error: String },

    /// Configuration is missing or inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Vision(#[from] VisionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for gatekeeper operations.
pub type GatekeeperResult<T> = std::result::Result<T, GatekeeperError>;
