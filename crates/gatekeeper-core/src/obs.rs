//! Structured events for the capture lifecycle.
//!
//! Every event carries an `event` field (`capture.started`, `plate.recognized`,
//! ...) so log pipelines can filter on it. Captures run inside a span tagged
//! with a `capture_id`; attach it with [`capture_span`] and
//! `tracing::Instrument` so the span follows the future across awaits.

use tracing::{info, warn, Span};
use uuid::Uuid;

/// Span for one capture, tagged with a fresh `capture_id`.
pub fn capture_span() -> (Span, String) {
    let capture_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("gatekeeper.capture", capture_id = %capture_id);
    (span, capture_id)
}

pub fn emit_capture_started(source: &str) {
    info!(event = "capture.started", source = %source);
}

pub fn emit_capture_finished(
    plate: Option<&str>,
    authorized: bool,
    gate_success: bool,
    attempts: u32,
    duration_ms: u64,
) {
    info!(
        event = "capture.finished",
        plate = plate.unwrap_or(""),
        authorized = authorized,
        gate_success = gate_success,
        attempts = attempts,
        duration_ms = duration_ms,
    );
}

/// A frame could not be read; the loop will retry.
pub fn emit_frame_unavailable(attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "capture.frame_unavailable", attempt = attempt, error = %error);
}

pub fn emit_no_candidates(attempt: u32) {
    info!(event = "capture.no_candidates", attempt = attempt);
}

pub fn emit_plate_recognized(plate: &str, backend: &str, confidence: Option<f32>) {
    info!(
        event = "plate.recognized",
        plate = %plate,
        backend = %backend,
        confidence = ?confidence,
    );
}

pub fn emit_authorization_decided(plate: &str, authorized: bool, latency_ms: u64, error: Option<&str>) {
    match error {
        Some(error) => warn!(
            event = "authorization.decided",
            plate = %plate,
            authorized = authorized,
            latency_ms = latency_ms,
            error = %error,
        ),
        None => info!(
            event = "authorization.decided",
            plate = %plate,
            authorized = authorized,
            latency_ms = latency_ms,
        ),
    }
}

pub fn emit_gate_result(open: bool, success: bool) {
    let command = if open { "open" } else { "close" };
    if success {
        info!(event = "gate.result", command = command, success = true);
    } else {
        warn!(event = "gate.result", command = command, success = false);
    }
}

pub fn emit_trigger(line: &str) {
    info!(event = "trigger.received", line = %line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_span_ids_are_unique() {
        let (_a, id_a) = capture_span();
        let (_b, id_b) = capture_span();
        assert_ne!(id_a, id_b);
        assert!(Uuid::parse_str(&id_a).is_ok());
    }
}
