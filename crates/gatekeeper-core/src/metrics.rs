//! Process-wide counters for the access loop.
//!
//! Incremented at the call site; [`Metrics::flush`] emits every value as one
//! `info!` event (end of a watch session, or on demand).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Atomic counters.
pub struct Metrics {
    captures: AtomicU64,
    plates_read: AtomicU64,
    grants: AtomicU64,
    denials: AtomicU64,
    gate_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            captures: AtomicU64::new(0),
            plates_read: AtomicU64::new(0),
            grants: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            gate_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_captures(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_plates_read(&self) {
        self.plates_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an authorization decision.
    pub fn record_decision(&self, authorized: bool) {
        if authorized {
            self.grants.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denials.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_gate_failures(&self) {
        self.gate_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "gate_failures", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            captures = self.captures(),
            plates_read = self.plates_read(),
            grants = self.grants(),
            denials = self.denials(),
            gate_failures = self.gate_failures(),
        );
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    pub fn plates_read(&self) -> u64 {
        self.plates_read.load(Ordering::Relaxed)
    }

    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    pub fn gate_failures(&self) -> u64 {
        self.gate_failures.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.captures,
            &self.plates_read,
            &self.grants,
            &self.denials,
            &self.gate_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_split_into_grants_and_denials() {
        let m = Metrics::new();
        m.record_decision(true);
        m.record_decision(false);
        m.record_decision(false);
        assert_eq!(m.grants(), 1);
        assert_eq!(m.denials(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_captures();
        m.inc_plates_read();
        m.inc_gate_failures();
        m.record_decision(true);
        m.reset();
        assert_eq!(m.captures(), 0);
        assert_eq!(m.plates_read(), 0);
        assert_eq!(m.gate_failures(), 0);
        assert_eq!(m.grants(), 0);
    }
}
