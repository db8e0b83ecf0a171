//! The gate actuator: one physical barrier, one exclusive command lock.
//!
//! Every transition runs the full write → settle → acknowledge exchange
//! under a single `tokio::sync::Mutex`, so commands from any caller are
//! serialized and never interleave on the wire. A failed exchange tears the
//! channel down; the next attempt reconnects. State only changes after an
//! acknowledgment. Protocols with a session line (`ENABLE` for the
//! single-byte firmware) send it on every connect, before any command.
//!
//! Auto-close is driven by one supervisor task per actuator that sleeps until
//! the deadline held in a `watch` channel. Arming a new deadline replaces the
//! old one, so at most one timer is ever pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConnector, GateChannel};
use crate::error::{GateError, GateResult, LinkError, LinkResult};
use crate::protocol::{acknowledges, Command, CommandKind, CommandProtocol, ControlLine};

/// Logical state of the barrier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

impl GateState {
    fn settled(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Open => GateState::Open,
            CommandKind::Close => GateState::Closed,
        }
    }

    fn transient(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Open => GateState::Opening,
            CommandKind::Close => GateState::Closing,
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateState::Closed => write!(f, "closed"),
            GateState::Opening => write!(f, "opening"),
            GateState::Open => write!(f, "open"),
            GateState::Closing => write!(f, "closing"),
        }
    }
}

/// Actuator tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Attempts per command, each with its own (re)connect.
    pub max_attempts: u32,
    /// Wait for the acknowledgment line after the settle delay (milliseconds).
    pub ack_timeout_ms: u64,
    /// Pause between writing a command and reading its acknowledgment.
    pub settle_ms: u64,
    /// How long the gate stays open before closing on its own.
    pub auto_close_ms: u64,
    /// Listener poll interval.
    pub listener_poll_ms: u64,
    /// Upper bound on one listener read, i.e. how long it may hold the lock.
    pub listener_read_ms: u64,
    pub protocol: CommandProtocol,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout_ms: 1000,
            settle_ms: 200,
            auto_close_ms: 5000,
            listener_poll_ms: 100,
            listener_read_ms: 50,
            protocol: CommandProtocol::Line,
        }
    }
}

impl ActuatorConfig {
    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn auto_close(&self) -> Duration {
        Duration::from_millis(self.auto_close_ms)
    }
}

/// A line the controller sent without being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareMessage {
    pub line: String,
    pub received_at: DateTime<Utc>,
}

/// Everything guarded by the command lock.
struct Link {
    channel: Option<Box<dyn GateChannel>>,
    state: GateState,
    last_transition: Instant,
    opened_at: Option<Instant>,
    shut_down: bool,
}

struct Shared {
    config: ActuatorConfig,
    connector: Arc<dyn ChannelConnector>,
    link: Mutex<Link>,
    sequence: AtomicU64,
    state_tx: watch::Sender<GateState>,
    deadline_tx: watch::Sender<Option<Instant>>,
    messages: broadcast::Sender<HardwareMessage>,
}

/// Handle to one physical gate. Cheap to clone; clones share the lock.
#[derive(Clone)]
pub struct GateActuator {
    shared: Arc<Shared>,
}

impl GateActuator {
    /// Create an actuator without touching the hardware; the first command
    /// connects. Must be called inside a Tokio runtime.
    pub fn new(config: ActuatorConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        let (state_tx, _) = watch::channel(GateState::Closed);
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let (messages, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            config,
            connector,
            link: Mutex::new(Link {
                channel: None,
                state: GateState::Closed,
                last_transition: Instant::now(),
                opened_at: None,
                shut_down: false,
            }),
            sequence: AtomicU64::new(0),
            state_tx,
            deadline_tx,
            messages,
        });
        tokio::spawn(run_auto_close(Arc::downgrade(&shared), deadline_rx));
        Self { shared }
    }

    /// Create an actuator and try to open the channel right away.
    ///
    /// An unreachable controller is not fatal: the actuator starts degraded
    /// and every command retries the connection.
    pub async fn connect(config: ActuatorConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        let actuator = Self::new(config, connector);
        {
            let mut link = actuator.shared.link.lock().await;
            match actuator.shared.open_channel().await {
                Ok(channel) => link.channel = Some(channel),
                Err(err) => warn!(
                    target_device = %actuator.shared.connector.target(),
                    error = %err,
                    "gate controller unavailable; running degraded"
                ),
            }
        }
        actuator
    }

    /// Open the gate (or re-arm auto-close if it is already open).
    pub async fn request_open(&self) -> GateResult<GateState> {
        self.request(CommandKind::Open).await
    }

    /// Close the gate. No-op when it is already closed.
    pub async fn request_close(&self) -> GateResult<GateState> {
        self.request(CommandKind::Close).await
    }

    async fn request(&self, kind: CommandKind) -> GateResult<GateState> {
        let mut link = self.shared.link.lock().await;
        if link.shut_down {
            return Err(GateError::Shutdown);
        }
        self.shared.transition(&mut link, kind).await
    }

    /// Close the gate if it has been open for the configured duration.
    ///
    /// Returns `Ok(true)` when a close was issued and acknowledged.
    pub async fn check_auto_close(&self) -> GateResult<bool> {
        let mut link = self.shared.link.lock().await;
        self.shared.close_if_expired(&mut link).await
    }

    /// Last acknowledged state, or the transient state of an exchange in flight.
    pub fn state(&self) -> GateState {
        *self.shared.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<GateState> {
        self.shared.state_tx.subscribe()
    }

    /// When the pending auto-close fires, if one is armed.
    pub fn auto_close_deadline(&self) -> Option<Instant> {
        *self.shared.deadline_tx.borrow()
    }

    /// Subscribe to unsolicited controller messages.
    pub fn subscribe(&self) -> broadcast::Receiver<HardwareMessage> {
        self.shared.messages.subscribe()
    }

    pub fn config(&self) -> &ActuatorConfig {
        &self.shared.config
    }

    /// Start draining unsolicited messages in the background.
    ///
    /// The task holds the command lock only for one bounded read per poll
    /// and exits once every actuator handle is dropped.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let poll = Duration::from_millis(self.shared.config.listener_poll_ms.max(1));
        let read_window = Duration::from_millis(self.shared.config.listener_read_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let mut link = shared.link.lock().await;
                if link.shut_down {
                    return;
                }
                let Some(channel) = link.channel.as_mut() else {
                    continue;
                };
                let read = tokio::time::timeout(read_window, channel.read_line()).await;
                match read {
                    Ok(Ok(Some(line))) => shared.publish(line),
                    Ok(Ok(None)) => {
                        warn!("gate controller closed the channel; will reconnect on next command");
                        link.channel = None;
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "listener read failed; dropping channel");
                        link.channel = None;
                    }
                    Err(_) => {}
                }
            }
        })
    }

    /// Close the gate and release the channel. Later commands fail with
    /// [`GateError::Shutdown`].
    pub async fn shutdown(&self) -> GateResult<()> {
        let mut link = self.shared.link.lock().await;
        if link.shut_down {
            return Ok(());
        }
        let result = self
            .shared
            .transition(&mut link, CommandKind::Close)
            .await
            .map(|_| ());
        if let Err(err) = &result {
            warn!(error = %err, "gate did not acknowledge close during shutdown");
        }
        if let (Some(end), Some(channel)) =
            (self.shared.config.protocol.session_end(), link.channel.as_mut())
        {
            if let Err(err) = self.shared.control(channel.as_mut(), end).await {
                warn!(error = %err, "controller did not confirm session end");
            }
        }
        link.shut_down = true;
        link.channel = None;
        self.shared.deadline_tx.send_replace(None);
        info!("gate actuator shut down");
        result
    }
}

impl Shared {
    async fn transition(&self, link: &mut Link, kind: CommandKind) -> GateResult<GateState> {
        let target = GateState::settled(kind);
        if link.state == target {
            if kind == CommandKind::Open {
                // A repeated open keeps the gate up for another full period.
                let now = Instant::now();
                link.opened_at = Some(now);
                self.arm_auto_close(now + self.config.auto_close());
            }
            debug!(state = %link.state, "gate already {target}; no command sent");
            return Ok(link.state);
        }

        let command = Command {
            kind,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        };
        self.state_tx.send_replace(GateState::transient(kind));

        match self.exchange(link, command).await {
            Ok(attempts) => {
                let now = Instant::now();
                link.state = target;
                link.last_transition = now;
                match kind {
                    CommandKind::Open => {
                        link.opened_at = Some(now);
                        self.arm_auto_close(now + self.config.auto_close());
                    }
                    CommandKind::Close => {
                        link.opened_at = None;
                        self.deadline_tx.send_replace(None);
                    }
                }
                self.state_tx.send_replace(target);
                info!(
                    event = "gate.command",
                    command = %kind,
                    sequence = command.sequence,
                    attempts,
                    state = %target,
                    "gate command acknowledged"
                );
                Ok(target)
            }
            Err(err) => {
                self.state_tx.send_replace(link.state);
                warn!(
                    event = "gate.command_failed",
                    command = %kind,
                    sequence = command.sequence,
                    state = %link.state,
                    error = %err,
                    "gate command failed; state unchanged"
                );
                Err(err)
            }
        }
    }

    /// Run up to `max_attempts` exchanges; returns the attempt that succeeded.
    async fn exchange(&self, link: &mut Link, command: Command) -> GateResult<u32> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let mut channel = match link.channel.take() {
                Some(channel) => channel,
                None => match self.open_channel().await {
                    Ok(channel) => channel,
                    Err(err) => {
                        warn!(attempt, command = %command.kind, error = %err, "reconnect failed");
                        last_error = err.to_string();
                        continue;
                    }
                },
            };

            match self.exchange_once(channel.as_mut(), command).await {
                Ok(()) => {
                    link.channel = Some(channel);
                    return Ok(attempt);
                }
                Err(err) => {
                    // Dropping the channel tears it down; the next attempt reopens.
                    warn!(
                        attempt,
                        command = %command.kind,
                        channel = %channel.describe(),
                        error = %err,
                        "gate exchange failed; reconnecting"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(GateError::Exhausted {
            command: command.kind,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Connect and run the protocol's session setup.
    async fn open_channel(&self) -> LinkResult<Box<dyn GateChannel>> {
        let mut channel = self.connector.connect().await?;
        if let Some(start) = self.config.protocol.session_start() {
            self.control(channel.as_mut(), start).await?;
            debug!(channel = %channel.describe(), "controller session started");
        }
        Ok(channel)
    }

    async fn control(&self, channel: &mut dyn GateChannel, line: ControlLine) -> LinkResult<()> {
        if self.send_and_await(channel, line.bytes, |l| acknowledges(l, line.ack_token)).await? {
            Ok(())
        } else {
            Err(LinkError::SessionTimeout {
                token: line.ack_token,
                timeout_ms: self.config.ack_timeout_ms,
            })
        }
    }

    async fn exchange_once(&self, channel: &mut dyn GateChannel, command: Command) -> LinkResult<()> {
        let pending = channel.clear_input().await?;
        let reached = pending.iter().any(|line| command.kind.is_reached_by(line));
        for line in pending {
            self.publish(line);
        }
        if reached {
            debug!(sequence = command.sequence, "controller already reached {}", command.kind);
            return Ok(());
        }

        let kind = command.kind;
        let acked = self
            .send_and_await(channel, self.config.protocol.encode(kind), |line| {
                kind.is_ack(line) || kind.is_reached_by(line)
            })
            .await?;
        if acked {
            debug!(sequence = command.sequence, "acknowledged");
            Ok(())
        } else {
            Err(LinkError::AckTimeout {
                command: kind,
                timeout_ms: self.config.ack_timeout_ms,
            })
        }
    }

    /// Write `bytes`, settle, then read until `is_ack` accepts a line or the
    /// ack timeout passes. Other lines are published as unsolicited.
    async fn send_and_await(
        &self,
        channel: &mut dyn GateChannel,
        bytes: &[u8],
        is_ack: impl Fn(&str) -> bool,
    ) -> LinkResult<bool> {
        channel.write_all(bytes).await?;
        if self.config.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;
        }

        let deadline = Instant::now() + self.config.ack_timeout();
        loop {
            let line = match tokio::time::timeout_at(deadline, channel.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(LinkError::Closed),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Ok(false),
            };
            if is_ack(&line) {
                debug!(ack = %line, "controller answered");
                return Ok(true);
            }
            self.publish(line);
        }
    }

    async fn close_if_expired(&self, link: &mut Link) -> GateResult<bool> {
        let expired = link.state == GateState::Open
            && link
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.config.auto_close());
        if !expired || link.shut_down {
            return Ok(false);
        }

        info!(event = "gate.auto_close", "auto-close period elapsed");
        match self.transition(link, CommandKind::Close).await {
            Ok(_) => Ok(true),
            Err(err) => {
                // Keep a timer pending while the gate is believed open.
                self.arm_auto_close(Instant::now() + self.config.ack_timeout());
                Err(err)
            }
        }
    }

    fn arm_auto_close(&self, at: Instant) {
        self.deadline_tx.send_replace(Some(at));
    }

    fn publish(&self, line: String) {
        debug!(event = "gate.unsolicited", line = %line);
        // No subscribers is fine; the line has been logged.
        let _ = self.messages.send(HardwareMessage {
            line,
            received_at: Utc::now(),
        });
    }
}

/// Auto-close supervisor: sleeps until the armed deadline, then checks.
async fn run_auto_close(shared: Weak<Shared>, mut deadline_rx: watch::Receiver<Option<Instant>>) {
    loop {
        let armed = *deadline_rx.borrow_and_update();
        match armed {
            None => {
                if deadline_rx.changed().await.is_err() {
                    return;
                }
            }
            Some(at) => {
                tokio::select! {
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(at) => {
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };
                        let mut link = shared.link.lock().await;
                        // A newer open may have re-armed while we waited for the lock.
                        if *shared.deadline_tx.borrow() != Some(at) {
                            continue;
                        }
                        match shared.close_if_expired(&mut link).await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Nothing left to close; disarm so the loop parks.
                                if *shared.deadline_tx.borrow() == Some(at) {
                                    shared.deadline_tx.send_replace(None);
                                }
                            }
                            Err(err) => warn!(error = %err, "auto-close failed; will retry"),
                        }
                    }
                }
            }
        }
    }
}
