//! Global atomic counters for promoter runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    candidates_evaluated: AtomicU64,
    promotions: AtomicU64,
    failed_attempts: AtomicU64,
    guard_checks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            candidates_evaluated: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            guard_checks: AtomicU64::new(0),
        }
    }

    pub fn inc_candidates_evaluated(&self) {
        self.candidates_evaluated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_evaluated", "counter incremented");
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "promotions", "counter incremented");
    }

    pub fn inc_failed_attempts(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "failed_attempts", "counter incremented");
    }

    pub fn inc_guard_checks(&self) {
        self.guard_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            candidates_evaluated = self.candidates_evaluated(),
            promotions = self.promotions(),
            failed_attempts = self.failed_attempts(),
            guard_checks = self.guard_checks(),
        );
    }

    pub fn candidates_evaluated(&self) -> u64 {
        self.candidates_evaluated.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn guard_checks(&self) -> u64 {
        self.guard_checks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.candidates_evaluated.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.failed_attempts.store(0, Ordering::Relaxed);
        self.guard_checks.store(0, Ordering::Relaxed);
    }
}
