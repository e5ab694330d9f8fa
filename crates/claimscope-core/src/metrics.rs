//! Global atomic counters for the engine.
//!
//! Call sites increment silently; [`Metrics::flush`] reports every counter
//! as one `info!` event (the daemon flushes on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    runs_submitted: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    leases_reclaimed: AtomicU64,
    harness_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_submitted: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            leases_reclaimed: AtomicU64::new(0),
            harness_retries: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    /// A new run was created (idempotent re-submissions do not count).
    pub fn inc_submitted(&self) {
        Self::bump(&self.runs_submitted, "runs_submitted");
    }

    /// A run reached `succeeded`.
    pub fn inc_completed(&self) {
        Self::bump(&self.runs_completed, "runs_completed");
    }

    /// A run reached `failed`.
    pub fn inc_failed(&self) {
        Self::bump(&self.runs_failed, "runs_failed");
    }

    pub fn inc_reclaimed(&self) {
        Self::bump(&self.leases_reclaimed, "leases_reclaimed");
    }

    pub fn inc_retries(&self) {
        Self::bump(&self.harness_retries, "harness_retries");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_submitted = self.runs_submitted(),
            runs_completed = self.runs_completed(),
            runs_failed = self.runs_failed(),
            leases_reclaimed = self.leases_reclaimed(),
            harness_retries = self.harness_retries(),
        );
    }

    pub fn runs_submitted(&self) -> u64 {
        self.runs_submitted.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn leases_reclaimed(&self) -> u64 {
        self.leases_reclaimed.load(Ordering::Relaxed)
    }

    pub fn harness_retries(&self) -> u64 {
        self.harness_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_submitted,
            &self.runs_completed,
            &self.runs_failed,
            &self.leases_reclaimed,
            &self.harness_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_submitted();
        m.inc_submitted();
        m.inc_failed();
        m.inc_retries();
        m.inc_retries();
        m.inc_retries();
        assert_eq!(m.runs_submitted(), 2);
        assert_eq!(m.runs_failed(), 1);
        assert_eq!(m.harness_retries(), 3);
        assert_eq!(m.runs_completed(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_completed();
        m.inc_reclaimed();
        m.reset();
        assert_eq!(m.runs_completed(), 0);
        assert_eq!(m.leases_reclaimed(), 0);
    }
}
