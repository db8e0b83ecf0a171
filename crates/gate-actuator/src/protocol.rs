//! Wire protocol spoken to the barrier controller.
//!
//! Commands are short ASCII writes; the controller answers with a line that
//! contains `OPENED` or `CLOSED` as a word. Anything else it prints is
//! unsolicited.

use serde::{Deserialize, Serialize};

/// A requested actuator transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Open,
    Close,
}

impl CommandKind {
    /// Token the controller includes in its acknowledgment line.
    pub fn ack_token(&self) -> &'static str {
        match self {
            CommandKind::Open => "OPENED",
            CommandKind::Close => "CLOSED",
        }
    }

    /// Whether `line` acknowledges this command.
    ///
    /// Matching is ASCII case-insensitive: firmware that prints
    /// `Gate opened by command` acknowledges an open.
    pub fn is_ack(&self, line: &str) -> bool {
        acknowledges(line, self.ack_token())
    }

    /// Whether `line` reports that the controller reached this command's
    /// state on its own, e.g. its firmware-side auto-close.
    pub fn is_reached_by(&self, line: &str) -> bool {
        match self {
            CommandKind::Open => false,
            CommandKind::Close => acknowledges(line, "AUTO-CLOSED"),
        }
    }
}

/// Whether `line` carries `token` as a standalone word.
///
/// Transitions the controller made on its own are not acknowledgments:
/// `Gate auto-closed after timeout` has no bare `CLOSED` word, and sensor
/// lines are skipped outright.
pub fn acknowledges(line: &str, token: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    if upper.contains("SENSOR") {
        return false;
    }
    upper
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .any(|word| word == token)
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Open => write!(f, "open"),
            CommandKind::Close => write!(f, "close"),
        }
    }
}

/// One command issued against the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    /// Monotonic per-actuator sequence number.
    pub sequence: u64,
}

/// How commands are encoded on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandProtocol {
    /// `OPEN\n` / `CLOSE\n`
    #[default]
    Line,
    /// `1` / `0`, for the simpler firmware. That firmware ignores `1` until
    /// it has been sent `ENABLE`, and resets to disabled on every connect.
    SingleByte,
}

/// Session setup or teardown line and the word that acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLine {
    pub bytes: &'static [u8],
    pub ack_token: &'static str,
}

impl CommandProtocol {
    /// Bytes written for `kind`.
    pub fn encode(&self, kind: CommandKind) -> &'static [u8] {
        match (self, kind) {
            (CommandProtocol::Line, CommandKind::Open) => b"OPEN\n",
            (CommandProtocol::Line, CommandKind::Close) => b"CLOSE\n",
            (CommandProtocol::SingleByte, CommandKind::Open) => b"1",
            (CommandProtocol::SingleByte, CommandKind::Close) => b"0",
        }
    }

    /// Sent after every connect before any command.
    pub fn session_start(&self) -> Option<ControlLine> {
        match self {
            CommandProtocol::Line => None,
            CommandProtocol::SingleByte => Some(ControlLine {
                bytes: b"ENABLE\n",
                ack_token: "ENABLED",
            }),
        }
    }

    /// Sent on shutdown, after the final close.
    pub fn session_end(&self) -> Option<ControlLine> {
        match self {
            CommandProtocol::Line => None,
            CommandProtocol::SingleByte => Some(ControlLine {
                bytes: b"DISABLE\n",
                ack_token: "DISABLED",
            }),
        }
    }
}
