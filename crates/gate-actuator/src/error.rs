//! Error types for gate-actuator

use thiserror::Error;

use crate::protocol::CommandKind;

/// Errors raised by a single exchange on the hardware channel.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The channel could not be opened
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    /// Read or write on an open channel failed
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The far end closed the channel
    #[error("channel closed by peer")]
    Closed,

    /// No acknowledgment arrived in time
    #[error("no {command} acknowledgment within {timeout_ms}ms")]
    AckTimeout { command: CommandKind, timeout_ms: u64 },

    /// The controller did not confirm a session line after connect or before release
    #[error("controller did not report {token} within {timeout_ms}ms")]
    SessionTimeout {
        token: &'static str,
        timeout_ms: u64,
    },
}

/// Errors surfaced to callers of [`crate::GateActuator`].
#[derive(Error, Debug)]
pub enum GateError {
    /// Every attempt (including reconnects) failed; state was left unchanged
    #[error("{command} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        command: CommandKind,
        attempts: u32,
        last_error: String,
    },

    /// The actuator was shut down
    #[error("gate actuator is shut down")]
    Shutdown,
}

/// Result type for channel operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Result type for gate operations.
pub type GateResult<T> = std::result::Result<T, GateError>;
