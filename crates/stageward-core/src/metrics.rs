//! Global atomic counters for Stageward.
//!
//! Counters are incremented at the call site. Call [`Metrics::flush`] to
//! emit current values as a single `tracing::info!` event (the CLI does
//! this at the end of each command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    plans_executed: AtomicU64,
    applies_executed: AtomicU64,
    incidents_opened: AtomicU64,
    lock_retries: AtomicU64,
    drift_detected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            plans_executed: AtomicU64::new(0),
            applies_executed: AtomicU64::new(0),
            incidents_opened: AtomicU64::new(0),
            lock_retries: AtomicU64::new(0),
            drift_detected: AtomicU64::new(0),
        }
    }

    pub fn inc_plans(&self) {
        self.plans_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "plans_executed", "counter incremented");
    }

    /// Counts apply and destroy invocations.
    pub fn inc_applies(&self) {
        self.applies_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "applies_executed", "counter incremented");
    }

    pub fn inc_incidents_opened(&self) {
        self.incidents_opened.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "incidents_opened", "counter incremented");
    }

    pub fn inc_lock_retries(&self) {
        self.lock_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "lock_retries", "counter incremented");
    }

    pub fn inc_drift_detected(&self) {
        self.drift_detected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "drift_detected", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            plans_executed = self.plans_executed(),
            applies_executed = self.applies_executed(),
            incidents_opened = self.incidents_opened(),
            lock_retries = self.lock_retries(),
            drift_detected = self.drift_detected(),
        );
    }

    pub fn plans_executed(&self) -> u64 {
        self.plans_executed.load(Ordering::Relaxed)
    }

    pub fn applies_executed(&self) -> u64 {
        self.applies_executed.load(Ordering::Relaxed)
    }

    pub fn incidents_opened(&self) -> u64 {
        self.incidents_opened.load(Ordering::Relaxed)
    }

    pub fn lock_retries(&self) -> u64 {
        self.lock_retries.load(Ordering::Relaxed)
    }

    pub fn drift_detected(&self) -> u64 {
        self.drift_detected.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.plans_executed.store(0, Ordering::Relaxed);
        self.applies_executed.store(0, Ordering::Relaxed);
        self.incidents_opened.store(0, Ordering::Relaxed);
        self.lock_retries.store(0, Ordering::Relaxed);
        self.drift_detected.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_plans();
        m.inc_plans();
        m.inc_applies();
        m.inc_lock_retries();
        m.inc_lock_retries();
        m.inc_lock_retries();
        assert_eq!(m.plans_executed(), 2);
        assert_eq!(m.applies_executed(), 1);
        assert_eq!(m.lock_retries(), 3);
        assert_eq!(m.incidents_opened(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_incidents_opened();
        m.inc_drift_detected();
        m.reset();
        assert_eq!(m.incidents_opened(), 0);
        assert_eq!(m.drift_detected(), 0);
    }
}
