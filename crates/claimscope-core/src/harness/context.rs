//! Invocation context: cancellation, cost metering, progress and artifacts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use claimscope_state::{ModelConfig, OpsTelemetry, Progress};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{HarnessError, UnitOutcome};
use crate::stats;

/// Raw artifact bytes emitted by a harness; stored content-addressed later.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPayload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MeterState {
    spent_usd: f64,
    charges: u64,
    exhausted: bool,
    /// Cost of work that ran but was refused a charge
    unmetered_usd: f64,
}

/// Running spend against a ceiling. Clones share the same ledger, so the
/// primary run, its retries and comparator runs all draw on one budget.
#[derive(Debug, Clone)]
pub struct BudgetMeter {
    budget_usd: f64,
    tolerance_usd: f64,
    state: Arc<Mutex<MeterState>>,
}

impl BudgetMeter {
    pub fn new(budget_usd: f64, tolerance_usd: f64) -> Self {
        Self {
            budget_usd,
            tolerance_usd,
            state: Arc::new(Mutex::new(MeterState {
                spent_usd: 0.0,
                charges: 0,
                exhausted: false,
                unmetered_usd: 0.0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeterState> {
        // A panic while holding the meter cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ceiling(&self) -> f64 {
        self.budget_usd + self.tolerance_usd
    }

    /// Record `cost` if it fits under the ceiling. A refused charge does
    /// not count as spend; it is kept apart as unmetered and marks the
    /// meter exhausted.
    pub fn charge(&self, cost_usd: f64) -> bool {
        let cost = cost_usd.max(0.0);
        let mut state = self.lock();
        if state.spent_usd + cost > self.ceiling() {
            state.exhausted = true;
            state.unmetered_usd += cost;
            return false;
        }
        state.spent_usd += cost;
        state.charges += 1;
        true
    }

    /// Whether a further spend of `estimate_usd` would still fit.
    pub fn admit(&self, estimate_usd: f64) -> bool {
        let mut state = self.lock();
        if state.spent_usd + estimate_usd.max(0.0) > self.ceiling() {
            state.exhausted = true;
            return false;
        }
        true
    }

    pub fn spent(&self) -> f64 {
        self.lock().spent_usd
    }

    /// Cost of units that finished after the ceiling was reached. The
    /// provider may still bill it.
    pub fn unmetered(&self) -> f64 {
        self.lock().unmetered_usd
    }

    pub fn budget(&self) -> f64 {
        self.budget_usd
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// Mean charge so far, used to estimate the next unit.
    pub fn mean_charge(&self) -> Option<f64> {
        let state = self.lock();
        (state.charges > 0).then(|| state.spent_usd / state.charges as f64)
    }
}

/// Everything recorded through the context during one attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub units: Vec<UnitOutcome>,
    pub total: Option<u64>,
    pub tokens_prompt: u64,
    pub tokens_output: u64,
    pub artifacts: Vec<ArtifactPayload>,
    /// Settings the harness observed before finishing
    pub environment_sha: Option<String>,
    pub dataset_variant: Option<String>,
}

/// Handle a harness uses to talk back to the engine.
#[derive(Debug, Clone)]
pub struct HarnessContext {
    cancel: CancellationToken,
    meter: BudgetMeter,
    pricing: Option<ModelConfig>,
    unit_cost_usd: Option<f64>,
    tally: Arc<Mutex<Tally>>,
    progress: Option<Arc<watch::Sender<OpsTelemetry>>>,
    attempt: Arc<AtomicU32>,
    started: Instant,
}

impl HarnessContext {
    pub fn new(cancel: CancellationToken, meter: BudgetMeter) -> Self {
        Self {
            cancel,
            meter,
            pricing: None,
            unit_cost_usd: None,
            tally: Arc::new(Mutex::new(Tally::default())),
            progress: None,
            attempt: Arc::new(AtomicU32::new(0)),
            started: Instant::now(),
        }
    }

    /// Token prices used when a unit does not report its own cost.
    pub fn with_pricing(mut self, model: ModelConfig) -> Self {
        self.pricing = Some(model);
        self
    }

    /// Fixed per-unit spend for offline harnesses.
    pub fn with_unit_cost(mut self, unit_cost_usd: Option<f64>) -> Self {
        self.unit_cost_usd = unit_cost_usd;
        self
    }

    pub fn with_progress(mut self, tx: Arc<watch::Sender<OpsTelemetry>>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn tally(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled (shutdown, deadline, budget).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn meter(&self) -> &BudgetMeter {
        &self.meter
    }

    /// Attempt currently running through this context, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::SeqCst);
    }

    /// Declare how many units this attempt will evaluate.
    pub fn set_total(&self, units: u64) {
        self.tally().total = Some(units);
        self.publish();
    }

    fn unit_cost(&self, unit: &UnitOutcome) -> f64 {
        unit.cost_usd
            .or_else(|| {
                self.pricing
                    .as_ref()
                    .and_then(|m| m.token_cost(unit.tokens_prompt, unit.tokens_output))
            })
            .or(self.unit_cost_usd)
            .unwrap_or(0.0)
    }

    fn refuse(&self) -> HarnessError {
        self.cancel.cancel();
        HarnessError::BudgetExhausted {
            spent_usd: self.meter.spent(),
            budget_usd: self.meter.budget(),
        }
    }

    /// Charge and record a finished unit. If its cost does not fit, the
    /// unit is dropped, the run is cancelled and `BudgetExhausted` returned.
    pub fn record_unit(&self, mut unit: UnitOutcome) -> Result<(), HarnessError> {
        let cost = self.unit_cost(&unit);
        if !self.meter.charge(cost) {
            return Err(self.refuse());
        }
        unit.cost_usd = Some(cost);
        {
            let mut tally = self.tally();
            tally.tokens_prompt += unit.tokens_prompt;
            tally.tokens_output += unit.tokens_output;
            tally.units.push(unit);
        }
        self.publish();
        Ok(())
    }

    /// Ask whether the next unit may start. Refusal cancels the run.
    pub fn admit_next(&self) -> Result<(), HarnessError> {
        let estimate = self
            .unit_cost_usd
            .or_else(|| self.meter.mean_charge())
            .unwrap_or(0.0);
        if self.meter.admit(estimate) {
            Ok(())
        } else {
            Err(self.refuse())
        }
    }

    /// Whether every planned unit has been recorded.
    pub fn plan_complete(&self) -> bool {
        let tally = self.tally();
        tally
            .total
            .map(|t| tally.units.len() as u64 >= t)
            .unwrap_or(false)
    }

    pub fn add_artifact(&self, name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) {
        self.tally().artifacts.push(ArtifactPayload {
            name: name.into(),
            content_type: content_type.into(),
            data,
        });
    }

    /// Report the environment and dataset actually in use, as soon as the
    /// harness knows them. A run cut short by the budget keeps these even
    /// though it never returns an output.
    pub fn observe_settings(&self, environment_sha: Option<String>, dataset_variant: Option<String>) {
        let mut tally = self.tally();
        if environment_sha.is_some() {
            tally.environment_sha = environment_sha;
        }
        if dataset_variant.is_some() {
            tally.dataset_variant = dataset_variant;
        }
    }

    /// Current telemetry: latency percentiles, tokens, cost and ETA.
    pub fn snapshot(&self) -> OpsTelemetry {
        let tally = self.tally();
        let completed = tally.units.len() as u64;
        let latencies: Vec<f64> = tally.units.iter().filter_map(|u| u.latency_s).collect();
        let (p50, p95) = match stats::p50_p95(&latencies) {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        let eta_s = match tally.total {
            Some(total) if completed > 0 && total >= completed => {
                let mean = self.started.elapsed().as_secs_f64() / completed as f64;
                Some(mean * (total - completed) as f64)
            }
            _ => None,
        };

        let mut extra = serde_json::Map::new();
        let unmetered = self.meter.unmetered();
        if unmetered > 0.0 {
            extra.insert("unmetered_spend_usd".to_string(), unmetered.into());
        }

        OpsTelemetry {
            latency_p50_s: p50,
            latency_p95_s: p95,
            tokens_prompt: tally.tokens_prompt,
            tokens_output: tally.tokens_output,
            cost_usd: self.meter.spent(),
            progress: Some(Progress {
                units_completed: completed,
                units_total: tally.total,
                eta_s,
            }),
            extra,
        }
    }

    fn publish(&self) {
        if let Some(tx) = &self.progress {
            tx.send_replace(self.snapshot());
        }
    }

    /// Take everything recorded so far and start a fresh tally. Spend
    /// already charged stays on the meter.
    pub fn take_tally(&self) -> Tally {
        std::mem::take(&mut *self.tally())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(id: &str, cost: f64) -> UnitOutcome {
        UnitOutcome {
            id: id.to_string(),
            passed: Some(true),
            cost_usd: Some(cost),
            latency_s: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn meter_refuses_over_ceiling() {
        let meter = BudgetMeter::new(1.0, 0.001);
        assert!(meter.charge(0.6));
        assert!(!meter.charge(0.5));
        assert!(meter.is_exhausted());
        assert!((meter.spent() - 0.6).abs() < 1e-12);
        assert!((meter.unmetered() - 0.5).abs() < 1e-12);
        assert!(meter.charge(0.4));
    }

    #[test]
    fn clones_share_the_ledger() {
        let meter = BudgetMeter::new(1.0, 0.0);
        let other = meter.clone();
        other.charge(0.25);
        assert_eq!(meter.spent(), 0.25);
    }

    #[test]
    fn refused_unit_cancels_run() {
        let ctx = HarnessContext::new(CancellationToken::new(), BudgetMeter::new(0.10, 0.0));
        ctx.set_total(3);
        ctx.record_unit(passed("a", 0.06)).unwrap();
        let err = ctx.record_unit(passed("b", 0.06)).unwrap_err();
        assert!(matches!(err, HarnessError::BudgetExhausted { .. }));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.take_tally().units.len(), 1);

        let ops = ctx.snapshot();
        assert!((ops.cost_usd - 0.06).abs() < 1e-12);
        let unmetered = ops.extra["unmetered_spend_usd"].as_f64().unwrap();
        assert!((unmetered - 0.06).abs() < 1e-12);
    }

    #[test]
    fn observed_settings_survive_until_taken() {
        let ctx = HarnessContext::new(CancellationToken::new(), BudgetMeter::new(1.0, 0.0));
        ctx.observe_settings(Some("sha-1".to_string()), None);
        ctx.observe_settings(None, Some("v2".to_string()));
        let tally = ctx.take_tally();
        assert_eq!(tally.environment_sha.as_deref(), Some("sha-1"));
        assert_eq!(tally.dataset_variant.as_deref(), Some("v2"));
        assert_eq!(ctx.take_tally().environment_sha, None);
    }

    #[test]
    fn admit_next_uses_mean_charge() {
        let ctx = HarnessContext::new(CancellationToken::new(), BudgetMeter::new(0.10, 0.0));
        ctx.record_unit(passed("a", 0.04)).unwrap();
        ctx.admit_next().unwrap();
        ctx.record_unit(passed("b", 0.04)).unwrap();
        assert!(ctx.admit_next().is_err());
        assert!(ctx.meter().is_exhausted());
    }

    #[test]
    fn token_prices_apply_when_unit_has_no_cost() {
        let model = ModelConfig {
            provider: claimscope_state::Provider::OpenAi,
            name: "m".to_string(),
            api_key_ref: None,
            price_input_per_mtok: Some(1.0),
            price_output_per_mtok: Some(2.0),
        };
        let ctx = HarnessContext::new(CancellationToken::new(), BudgetMeter::new(1.0, 0.0)).with_pricing(model);
        ctx.record_unit(UnitOutcome {
            id: "a".into(),
            tokens_prompt: 100_000,
            tokens_output: 50_000,
            ..Default::default()
        })
        .unwrap();
        assert!((ctx.meter().spent() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn progress_is_published() {
        let (tx, rx) = watch::channel(OpsTelemetry::default());
        let ctx = HarnessContext::new(CancellationToken::new(), BudgetMeter::new(1.0, 0.0))
            .with_progress(Arc::new(tx));
        ctx.set_total(4);
        ctx.record_unit(passed("a", 0.01)).unwrap();

        let ops = rx.borrow().clone();
        let progress = ops.progress.unwrap();
        assert_eq!(progress.units_completed, 1);
        assert_eq!(progress.units_total, Some(4));
        assert!(progress.eta_s.is_some());
        assert_eq!(ops.latency_p50_s, Some(1.0));
        assert!(!ctx.plan_complete());
    }
}
