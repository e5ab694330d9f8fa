//! Structured lifecycle events for runs.
//!
//! Every function here emits one `tracing` event with a stable `event`
//! field so log pipelines can filter on it. [`RunSpan`] tags everything
//! logged while a worker drives a run with its `run_id` and `claim_id`.

use tracing::{info, warn};

/// RAII guard for a run-scoped span.
///
/// ```ignore
/// let _span = RunSpan::enter("5f0c...", "claim-42");
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, claim_id: &str) -> Self {
        Self {
            _span: run_span(run_id, claim_id).entered(),
        }
    }
}

/// The span itself, for instrumenting futures with `.instrument(..)`.
pub fn run_span(run_id: &str, claim_id: &str) -> tracing::Span {
    tracing::info_span!("claimscope.run", run_id = %run_id, claim_id = %claim_id)
}

pub fn emit_run_submitted(run_id: &str, claim_id: &str, created: bool) {
    info!(event = "run.submitted", run_id = %run_id, claim_id = %claim_id, created = created);
}

pub fn emit_run_leased(run_id: &str, owner: &str, attempt: u32) {
    info!(event = "run.leased", run_id = %run_id, owner = %owner, attempt = attempt);
}

/// Emitted at debug level; progress can be chatty.
pub fn emit_run_progress(run_id: &str, units_completed: u64, units_total: Option<u64>, cost_usd: f64) {
    tracing::debug!(
        event = "run.progress",
        run_id = %run_id,
        units_completed = units_completed,
        units_total = ?units_total,
        cost_usd = cost_usd,
    );
}

pub fn emit_run_finished(run_id: &str, status: &str, label: Option<&str>, duration_ms: u64, cost_usd: f64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        label = label.unwrap_or("-"),
        duration_ms = duration_ms,
        cost_usd = cost_usd,
    );
}

pub fn emit_run_released(run_id: &str, owner: &str) {
    info!(event = "run.released", run_id = %run_id, owner = %owner);
}

/// A lease expired. `requeued` is false when the run was failed instead.
pub fn emit_run_reclaimed(run_id: &str, lease_expiries: u32, requeued: bool) {
    warn!(event = "run.reclaimed", run_id = %run_id, lease_expiries = lease_expiries, requeued = requeued);
}

pub fn emit_harness_retry(run_id: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "harness.retry",
        run_id = %run_id,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

pub fn emit_verdict_classified(run_id: &str, label: &str, score: Option<f64>, reference: Option<f64>) {
    info!(
        event = "verdict.classified",
        run_id = %run_id,
        label = %label,
        score = ?score,
        reference = ?reference,
    );
}

pub fn emit_trace_recorded(run_id: &str, trace_id: &str, harness_cmd: &str) {
    info!(event = "trace.recorded", run_id = %run_id, trace_id = %trace_id, harness_cmd = %harness_cmd);
}

pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters() {
        let _span = RunSpan::enter("run-1", "claim-1");
        emit_run_leased("run-1", "worker-0", 1);
    }
}
