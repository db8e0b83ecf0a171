//! In-memory gate controller for tests.
//!
//! [`FakeGateHardware`] behaves like the barrier firmware: it acknowledges
//! commands, can go offline, can ignore commands, and can print unsolicited
//! lines. Like the single-byte firmware it ignores `1` until `ENABLE`, and
//! every connect resets it to disabled. Everything is observable afterwards through the write log and the
//! transcript.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{ChannelConnector, GateChannel};
use crate::error::{LinkError, LinkResult};

#[derive(Default)]
struct HardwareState {
    online: bool,
    responsive: bool,
    enabled: bool,
    ack_delay: Duration,
    generation: u64,
    connects: usize,
    connect_attempts: usize,
    writes: Vec<String>,
    transcript: Vec<String>,
    outbox: VecDeque<(Instant, String)>,
}

struct Inner {
    state: Mutex<HardwareState>,
    notify: Notify,
}

/// Simulated barrier controller shared between a test and its actuator.
#[derive(Clone)]
pub struct FakeGateHardware {
    inner: Arc<Inner>,
}

impl Default for FakeGateHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateHardware {
    /// An online controller that acknowledges immediately.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HardwareState {
                    online: true,
                    responsive: true,
                    ..Default::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HardwareState> {
        // Poisoned by a panicking test thread; keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offline refuses new connections and kills open channels.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        if state.online && !online {
            state.generation += 1;
            state.outbox.clear();
        }
        state.online = online;
        drop(state);
        self.inner.notify.notify_one();
    }

    /// An unresponsive controller accepts writes but never acknowledges.
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    /// Delay between a command write and its acknowledgment.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.lock().ack_delay = delay;
    }

    /// Queue a line the controller prints on its own.
    pub fn push_unsolicited(&self, line: impl Into<String>) {
        self.lock().outbox.push_back((Instant::now(), line.into()));
        self.inner.notify.notify_one();
    }

    /// Commands received, trimmed (`OPEN`, `CLOSE`, `1`, `0`).
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Ordered wire log: `tx:<command>` and `rx:<line>` entries.
    pub fn transcript(&self) -> Vec<String> {
        self.lock().transcript.clone()
    }

    /// Whether the controller has been sent `ENABLE` since its last reset.
    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Connects attempted so far, including refused ones.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connector(&self) -> Arc<dyn ChannelConnector> {
        Arc::new(FakeConnector { hw: self.clone() })
    }
}

struct FakeConnector {
    hw: FakeGateHardware,
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self) -> LinkResult<Box<dyn GateChannel>> {
        let mut state = self.hw.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(LinkError::Connect {
                target: self.target(),
                reason: "device offline".to_string(),
            });
        }
        state.connects += 1;
        state.enabled = false;
        let generation = state.generation;
        Ok(Box::new(FakeChannel {
            hw: self.hw.clone(),
            generation,
        }))
    }

    fn target(&self) -> String {
        "fake://gate".to_string()
    }
}

struct FakeChannel {
    hw: FakeGateHardware,
    generation: u64,
}

impl FakeChannel {
    fn alive(&self, state: &HardwareState) -> bool {
        state.online && state.generation == self.generation
    }
}

fn ack_for(command: &str, state: &mut HardwareState) -> Option<&'static str> {
    match command {
        "OPEN" => Some("OPENED"),
        "CLOSE" => Some("CLOSED"),
        "ENABLE" => {
            state.enabled = true;
            Some("System enabled - Ready for plate recognition")
        }
        "DISABLE" => {
            state.enabled = false;
            Some("System disabled - Manual mode")
        }
        "1" if state.enabled => Some("Gate opened by command"),
        "0" => Some("Gate closed by command"),
        _ => None,
    }
}

#[async_trait]
impl GateChannel for FakeChannel {
    async fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let mut state = self.hw.lock();
        if !self.alive(&state) {
            return Err(LinkError::Closed);
        }
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        state.transcript.push(format!("tx:{command}"));
        state.writes.push(command.clone());
        if state.responsive {
            if let Some(ack) = ack_for(&command, &mut state) {
                let at = Instant::now() + state.ack_delay;
                state.outbox.push_back((at, ack.to_string()));
            }
        }
        drop(state);
        self.hw.inner.notify.notify_one();
        Ok(())
    }

    async fn read_line(&mut self) -> LinkResult<Option<String>> {
        loop {
            let wake_at = {
                let mut state = self.hw.lock();
                if !self.alive(&state) {
                    return Ok(None);
                }
                match state.outbox.front().map(|(at, _)| *at) {
                    Some(at) if at <= Instant::now() => {
                        if let Some((_, line)) = state.outbox.pop_front() {
                            state.transcript.push(format!("rx:{line}"));
                            return Ok(Some(line));
                        }
                        None
                    }
                    other => other,
                }
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.hw.inner.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.hw.inner.notify.notified().await,
            }
        }
    }

    async fn clear_input(&mut self) -> LinkResult<Vec<String>> {
        let mut state = self.hw.lock();
        if !self.alive(&state) {
            return Err(LinkError::Closed);
        }
        let now = Instant::now();
        let mut drained = Vec::new();
        while state.outbox.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, line)) = state.outbox.pop_front() {
                drained.push(line);
            }
        }
        Ok(drained)
    }

    fn describe(&self) -> String {
        format!("fake://gate#{}", self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_acknowledges_line_commands() {
        let hw = FakeGateHardware::new();
        let mut channel = hw.connector().connect().await.unwrap();
        channel.write_all(b"OPEN\n").await.unwrap();
        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("OPENED"));
        assert_eq!(hw.transcript(), vec!["tx:OPEN", "rx:OPENED"]);
    }

    #[tokio::test]
    async fn test_single_byte_open_needs_enable() {
        let hw = FakeGateHardware::new();
        let mut channel = hw.connector().connect().await.unwrap();
        channel.write_all(b"1").await.unwrap();
        assert!(channel.clear_input().await.unwrap().is_empty());

        channel.write_all(b"ENABLE\n").await.unwrap();
        channel.write_all(b"1").await.unwrap();
        assert_eq!(
            channel.clear_input().await.unwrap(),
            vec![
                "System enabled - Ready for plate recognition",
                "Gate opened by command"
            ]
        );

        hw.connector().connect().await.unwrap();
        assert!(!hw.enabled());
    }

    #[tokio::test]
    async fn test_offline_refuses_connect_and_kills_channels() {
        let hw = FakeGateHardware::new();
        let mut channel = hw.connector().connect().await.unwrap();
        hw.set_online(false);
        assert!(matches!(channel.write_all(b"OPEN\n").await, Err(LinkError::Closed)));
        assert!(hw.connector().connect().await.is_err());
        assert_eq!(hw.connect_attempts(), 2);
        assert_eq!(hw.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_input_drains_unsolicited() {
        let hw = FakeGateHardware::new();
        let mut channel = hw.connector().connect().await.unwrap();
        hw.push_unsolicited("System initialized");
        assert_eq!(channel.clear_input().await.unwrap(), vec!["System initialized"]);
        assert!(channel.clear_input().await.unwrap().is_empty());
    }
}
