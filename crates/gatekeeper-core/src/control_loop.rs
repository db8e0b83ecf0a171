//! Detection-to-actuation orchestration.
//!
//! One capture: frame → perception → ensemble → authorization → gate, with a
//! bounded number of attempts. Nothing ambiguous ever opens the gate: missing
//! text, registry errors, and registry timeouts all end in a close.

use std::sync::Arc;
use std::time::Duration;

use gate_actuator::GateActuator;
use plate_vision::{FrameSource, PerceptionPipeline, TextExtractionEnsemble};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

use crate::authorization::{AuthorizationResult, PlateAuthorizer};
use crate::error::{GatekeeperError, GatekeeperResult};
use crate::metrics::METRICS;
use crate::obs;

/// Loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Frames tried per capture.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Upper bound on one registry lookup, enforced by the loop itself.
    pub authorization_timeout_ms: u64,
    /// Word in the controller line announcing a vehicle at the gate. The
    /// line-protocol controller prints `DETECT` from its sensor; the
    /// single-byte firmware prints nothing while enabled, so it is run
    /// with continuous captures instead.
    pub trigger_token: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
            authorization_timeout_ms: 3000,
            trigger_token: "DETECT".to_string(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> GatekeeperResult<()> {
        if self.max_attempts == 0 {
            return Err(GatekeeperError::Config("control.max_attempts must be at least 1".into()));
        }
        if self.authorization_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "control.authorization_timeout_ms must be positive".into(),
            ));
        }
        if self.trigger_token.trim().is_empty() {
            return Err(GatekeeperError::Config("control.trigger_token must not be empty".into()));
        }
        Ok(())
    }
}

/// Result of one capture, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub plate: Option<String>,
    pub authorized: bool,
    pub gate_success: bool,
    pub attempts: u32,
}

/// Reply to a direct gate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommandResponse {
    pub success: bool,
}

/// The access-control loop for one gate.
pub struct ControlLoop {
    perception: PerceptionPipeline,
    ensemble: Arc<TextExtractionEnsemble>,
    authorizer: Arc<dyn PlateAuthorizer>,
    gate: GateActuator,
    config: LoopConfig,
}

impl ControlLoop {
    pub fn new(
        perception: PerceptionPipeline,
        ensemble: Arc<TextExtractionEnsemble>,
        authorizer: Arc<dyn PlateAuthorizer>,
        gate: GateActuator,
        config: LoopConfig,
    ) -> Self {
        Self {
            perception,
            ensemble,
            authorizer,
            gate,
            config,
        }
    }

    pub fn gate(&self) -> &GateActuator {
        &self.gate
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run one capture against `source`.
    ///
    /// Returns [`GatekeeperError::NoFrame`] only when not a single frame
    /// could be read; every other failure is reported in the outcome.
    pub async fn handle_capture(&self, source: &dyn FrameSource) -> GatekeeperResult<CaptureOutcome> {
        let (span, _capture_id) = obs::capture_span();
        self.capture(source).instrument(span).await
    }

    async fn capture(&self, source: &dyn FrameSource) -> GatekeeperResult<CaptureOutcome> {
        METRICS.inc_captures();
        obs::emit_capture_started(&source.describe());
        let start = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut frames_read = 0u32;
        let mut last_frame_error = String::new();

        for attempt in 1..=max_attempts {
            let frame = match source.next_frame().await {
                Ok(frame) => frame,
                Err(err) => {
                    obs::emit_frame_unavailable(attempt, &err);
                    last_frame_error = err.to_string();
                    self.pause_before(attempt).await;
                    continue;
                }
            };
            frames_read += 1;

            let candidates = match self.perception.detect(&frame).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(attempt, error = %err, "perception failed; treating as no candidates");
                    Vec::new()
                }
            };

            if candidates.is_empty() {
                obs::emit_no_candidates(attempt);
                self.set_gate(false).await;
                self.pause_before(attempt).await;
                continue;
            }

            for candidate in &candidates {
                let text = match self.ensemble.read(candidate).await {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(attempt, error = %err, "text extraction failed for candidate");
                        continue;
                    }
                };

                METRICS.inc_plates_read();
                obs::emit_plate_recognized(&text.text, text.backend.as_str(), text.confidence);
                let decision = self.authorize(&text.text).await;
                let gate = self.set_gate(decision.authorized).await;
                return Ok(self.finish(
                    CaptureOutcome {
                        plate: Some(text.text),
                        authorized: decision.authorized,
                        gate_success: gate.success,
                        attempts: attempt,
                    },
                    start,
                ));
            }

            debug!(attempt, candidates = candidates.len(), "no usable text on any candidate");
            self.pause_before(attempt).await;
        }

        if frames_read == 0 {
            warn!(attempts = max_attempts, error = %last_frame_error, "no frame could be read");
            return Err(GatekeeperError::NoFrame {
                attempts: max_attempts,
                last_error: last_frame_error,
            });
        }

        let gate = self.set_gate(false).await;
        Ok(self.finish(
            CaptureOutcome {
                plate: None,
                authorized: false,
                gate_success: gate.success,
                attempts: max_attempts,
            },
            start,
        ))
    }

    async fn pause_before(&self, attempt: u32) {
        if attempt < self.config.max_attempts {
            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        }
    }

    fn finish(&self, outcome: CaptureOutcome, start: Instant) -> CaptureOutcome {
        obs::emit_capture_finished(
            outcome.plate.as_deref(),
            outcome.authorized,
            outcome.gate_success,
            outcome.attempts,
            start.elapsed().as_millis() as u64,
        );
        outcome
    }

    /// Registry lookup bounded by the loop's own timeout.
    pub async fn authorize(&self, plate: &str) -> AuthorizationResult {
        let timeout = Duration::from_millis(self.config.authorization_timeout_ms);
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.authorizer.lookup(plate, timeout)).await {
            Ok(result) => result,
            Err(_) => AuthorizationResult::failed(
                plate,
                start.elapsed().as_millis() as u64,
                format!("authorization timed out after {}ms", timeout.as_millis()),
            ),
        };
        METRICS.record_decision(result.authorized);
        obs::emit_authorization_decided(
            &result.plate,
            result.authorized,
            result.latency_ms,
            result.error.as_deref(),
        );
        result
    }

    /// Direct gate command, bypassing perception.
    pub async fn set_gate(&self, open: bool) -> GateCommandResponse {
        let result = if open {
            self.gate.request_open().await
        } else {
            self.gate.request_close().await
        };
        let success = match result {
            Ok(_) => true,
            Err(err) => {
                METRICS.inc_gate_failures();
                warn!(open, error = %err, "gate command failed");
                false
            }
        };
        obs::emit_gate_result(open, success);
        GateCommandResponse { success }
    }

    /// Wait for the controller to report a vehicle.
    ///
    /// Lines only arrive while something reads the channel, so run the
    /// actuator's listener (`spawn_listener`) alongside.
    pub async fn wait_for_trigger(&self, timeout: Duration) -> bool {
        let mut messages = self.gate.subscribe();
        let token = self.config.trigger_token.to_ascii_uppercase();
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, messages.recv()).await {
                Ok(Ok(message)) => {
                    if message.line.to_ascii_uppercase().contains(&token) {
                        obs::emit_trigger(&message.line);
                        return true;
                    }
                    debug!(line = %message.line, "controller message ignored");
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(skipped, "trigger subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => return false,
            }
        }
    }
}
