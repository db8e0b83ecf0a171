//! Hardware channel abstraction and transports.
//!
//! A [`GateChannel`] is one open connection to the controller. A
//! [`ChannelConnector`] knows how to (re)open one; the actuator tears a
//! channel down after a failed exchange and asks the connector for a fresh
//! one on the next attempt.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{LinkError, LinkResult};

/// Window used to sweep bytes already in flight when clearing input.
const DRAIN_WINDOW: Duration = Duration::from_millis(5);

/// One open, line-oriented connection to the controller.
#[async_trait]
pub trait GateChannel: Send {
    /// Write `bytes` and flush.
    async fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Wait for the next non-empty line. `Ok(None)` means end of stream.
    ///
    /// Must be cancel-safe: callers wrap it in timeouts, and a partially
    /// received line has to survive for the next call.
    async fn read_line(&mut self) -> LinkResult<Option<String>>;

    /// Discard pending input, returning any complete lines that were waiting.
    async fn clear_input(&mut self) -> LinkResult<Vec<String>>;

    /// Human-readable endpoint name for logs.
    fn describe(&self) -> String;
}

/// Opens channels to the controller.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> LinkResult<Box<dyn GateChannel>>;

    /// Human-readable endpoint name for logs.
    fn target(&self) -> String;
}

// ---------------------------------------------------------------------------
// LineChannel: any AsyncRead/AsyncWrite pair
// ---------------------------------------------------------------------------

/// Line framing over a reader/writer pair.
///
/// Bytes are accumulated in an internal buffer so `read_line` stays
/// cancel-safe under `tokio::time::timeout`.
pub struct LineChannel<R, W> {
    reader: R,
    writer: W,
    pending: Vec<u8>,
    label: String,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, label: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            pending: Vec::new(),
            label: label.into(),
        }
    }

    /// Pop the next complete non-empty line out of the buffer.
    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Read one chunk into the buffer; returns the number of bytes read.
    async fn fill(&mut self) -> LinkResult<usize> {
        let mut chunk = [0u8; 256];
        let n = self.reader.read(&mut chunk).await?;
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

#[async_trait]
impl<R, W> GateChannel for LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> LinkResult<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.fill().await? == 0 {
                // Flush a trailing unterminated line before reporting EOF.
                let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!rest.is_empty()).then_some(rest));
            }
        }
    }

    async fn clear_input(&mut self) -> LinkResult<Vec<String>> {
        loop {
            match tokio::time::timeout(DRAIN_WINDOW, self.fill()).await {
                Ok(Ok(0)) => return Err(LinkError::Closed),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => return Err(err),
                Err(_) => break,
            }
        }
        let mut drained = Vec::new();
        while let Some(line) = self.take_line() {
            drained.push(line);
        }
        self.pending.clear();
        Ok(drained)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Serial device node (e.g. `/dev/ttyACM0`), opened as a file.
///
/// Line speed is configured outside the process (udev rule or `stty`).
/// Opening the port resets most microcontroller boards, so the connector
/// waits `settle` before handing the channel out.
#[derive(Debug, Clone)]
pub struct SerialDeviceConnector {
    path: PathBuf,
    settle: Duration,
}

impl SerialDeviceConnector {
    pub fn new(path: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            path: path.into(),
            settle,
        }
    }
}

#[async_trait]
impl ChannelConnector for SerialDeviceConnector {
    async fn connect(&self) -> LinkResult<Box<dyn GateChannel>> {
        let open_err = |err: std::io::Error| LinkError::Connect {
            target: self.target(),
            reason: err.to_string(),
        };
        // Separate handles so a parked read never blocks a write.
        let reader = tokio::fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(open_err)?;
        let writer = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(open_err)?;

        if !self.settle.is_zero() {
            debug!(device = %self.target(), settle_ms = self.settle.as_millis() as u64, "waiting for controller reset");
            tokio::time::sleep(self.settle).await;
        }
        info!(device = %self.target(), "gate controller connected");
        Ok(Box::new(LineChannel::new(reader, writer, self.target())))
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }
}

/// TCP endpoint, typically a serial-over-network bridge.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    settle: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, settle: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            settle,
        }
    }
}

#[async_trait]
impl ChannelConnector for TcpConnector {
    async fn connect(&self) -> LinkResult<Box<dyn GateChannel>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LinkError::Connect {
                target: self.target(),
                reason: format!("timed out after {}ms", self.connect_timeout.as_millis()),
            })?
            .map_err(|err| LinkError::Connect {
                target: self.target(),
                reason: err.to_string(),
            })?;
        stream.set_nodelay(true)?;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        info!(endpoint = %self.addr, "gate controller connected");
        let (reader, writer) = stream.into_split();
        Ok(Box::new(LineChannel::new(reader, writer, self.target())))
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Transport selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkConfig {
    Serial {
        path: PathBuf,
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
    },
    Tcp {
        addr: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default)]
        settle_ms: u64,
    },
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::Serial {
            path: PathBuf::from("/dev/ttyACM0"),
            settle_ms: default_settle_ms(),
        }
    }
}

impl LinkConfig {
    /// Build the connector described by this config.
    pub fn connector(&self) -> std::sync::Arc<dyn ChannelConnector> {
        match self {
            LinkConfig::Serial { path, settle_ms } => std::sync::Arc::new(
                SerialDeviceConnector::new(path.clone(), Duration::from_millis(*settle_ms)),
            ),
            LinkConfig::Tcp {
                addr,
                connect_timeout_ms,
                settle_ms,
            } => std::sync::Arc::new(TcpConnector::new(
                addr.clone(),
                Duration::from_millis(*connect_timeout_ms),
                Duration::from_millis(*settle_ms),
            )),
        }
    }
}
