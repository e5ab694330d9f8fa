//! Harness executor.
//!
//! Drives one run through its harness under a wall-clock deadline and a
//! cost ceiling, retrying transient failures with backoff, then runs the
//! claim's comparator models on the same harness. The result is an
//! [`ExecutionReport`]; turning it into a terminal run is the caller's job.

mod error;
mod retry;

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use claimscope_state::{
    ArtifactRecord, CasStore, ClaimRecord, ConfidenceInterval, Diff, DiffReason, OpsTelemetry,
    RunRecord,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cas::store_artifacts;
use crate::config::EngineConfig;
use crate::domain::FailureKind;
use crate::harness::{
    ArtifactPayload, BudgetMeter, Harness, HarnessContext, HarnessDescriptor, HarnessError,
    HarnessRegistry, Invocation, RunResult,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::verdict::{settings_mismatches, ComparatorScore, Observation, VerdictPolicy};

pub use error::{ExecutionError, ExecutionResult};
pub use retry::RetryPolicy;

/// Executor knobs, usually taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub budget_tolerance_usd: f64,
    pub verdict: VerdictPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            budget_tolerance_usd: config.budget_tolerance_usd,
            verdict: config.verdict.clone(),
        }
    }
}

/// A scored run, ready for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub result: RunResult,
    pub ci: ConfidenceInterval,
    pub observation: Observation,
    pub comparators: Vec<ComparatorScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The harness produced a score, possibly partial after a budget cut.
    Completed(Box<Completed>),
    /// No harness is registered for the claim's domain and task.
    Unresolved,
    /// The invocation was rejected before any spend.
    Invalid { message: String },
    /// Terminal failure with explanatory diffs.
    Failed { kind: FailureKind, diffs: Vec<Diff> },
    /// Shutdown or lease loss interrupted the run; it should be requeued.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub descriptor: Option<HarnessDescriptor>,
    pub ops: OpsTelemetry,
    pub artifacts: Vec<ArtifactRecord>,
    pub errors: Vec<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl ExecutionReport {
    fn bare(outcome: ExecutionOutcome, descriptor: Option<HarnessDescriptor>) -> Self {
        Self {
            outcome,
            descriptor,
            ops: OpsTelemetry::default(),
            artifacts: Vec::new(),
            errors: Vec::new(),
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Result of the retry loop for one model.
enum Attempted {
    Scored(RunResult),
    Failed {
        kind: FailureKind,
        diffs: Vec<Diff>,
        errors: Vec<String>,
    },
    Cancelled,
}

pub struct Executor {
    registry: Arc<HarnessRegistry>,
    cas: Arc<dyn CasStore>,
    config: ExecutorConfig,
}

fn failure_diffs(kind: FailureKind, message: &str, attempts: u32, failures: &[String]) -> Vec<Diff> {
    let mut diffs = vec![Diff::new(kind.reason())
        .with_message(message)
        .with_field("attempts", attempts)];
    diffs.extend(
        failures
            .iter()
            .take(20)
            .map(|f| Diff::new(DiffReason::FailureSummary).with_message(f.clone())),
    );
    diffs
}

impl Executor {
    pub fn new(registry: Arc<HarnessRegistry>, cas: Arc<dyn CasStore>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            cas,
            config,
        }
    }

    pub fn policy(&self) -> &VerdictPolicy {
        &self.config.verdict
    }

    fn validate(run: &RunRecord, claim: &ClaimRecord) -> Result<(), String> {
        if !run.budget_usd.is_finite() || run.budget_usd < 0.0 {
            return Err(format!("budget {} is not a non-negative amount", run.budget_usd));
        }
        if claim.settings.timeout_s == Some(0) {
            return Err("timeout_s must be positive".to_string());
        }
        if run.model_config.name.trim().is_empty() {
            return Err("model name is empty".to_string());
        }
        if let Some(r) = claim.reference_score {
            if !r.is_finite() {
                return Err("reference score is not finite".to_string());
            }
        }
        Ok(())
    }

    /// Execute `run` for `claim`. Cancelling `shutdown` interrupts the run
    /// and yields [`ExecutionOutcome::Cancelled`]. Progress snapshots are
    /// published on `progress` as units complete.
    pub async fn execute(
        &self,
        run: &RunRecord,
        claim: &ClaimRecord,
        shutdown: &CancellationToken,
        progress: Option<Arc<watch::Sender<OpsTelemetry>>>,
    ) -> ExecutionResult<ExecutionReport> {
        let Some(harness) = self.registry.resolve(&claim.domain, &claim.task) else {
            info!(domain = %claim.domain, task = %claim.task, "no harness registered");
            return Ok(ExecutionReport::bare(ExecutionOutcome::Unresolved, None));
        };
        let descriptor = harness.descriptor().clone();
        if let Err(message) = Self::validate(run, claim) {
            return Ok(ExecutionReport::bare(
                ExecutionOutcome::Invalid { message },
                Some(descriptor),
            ));
        }

        let started = Instant::now();
        let meter = BudgetMeter::new(run.budget_usd, self.config.budget_tolerance_usd);
        let token = shutdown.child_token();
        let mut ctx = HarnessContext::new(token.clone(), meter.clone())
            .with_pricing(run.model_config.clone())
            .with_unit_cost(descriptor.unit_cost_usd);
        if let Some(tx) = progress {
            ctx = ctx.with_progress(tx);
        }
        let invocation = Invocation {
            run_id: run.run_id.clone(),
            claim: claim.clone(),
            model: run.model_config.clone(),
            budget_usd: run.budget_usd,
            attempt: 1,
        };

        let timeout = claim.settings.timeout();
        // Primary telemetry and artifacts, set once the primary model scores.
        let scored: OnceLock<(OpsTelemetry, Vec<ArtifactPayload>)> = OnceLock::new();
        let work = async {
            let (primary, attempts, ops) = self.attempt(harness.as_ref(), invocation.clone(), &ctx).await;
            let tally_artifacts = ctx.take_tally().artifacts;
            let comparators = match &primary {
                Attempted::Scored(result) => {
                    let _ = scored.set((ops.clone(), result.artifacts.clone()));
                    self.run_comparators(harness.as_ref(), &invocation, &ctx).await
                }
                _ => Vec::new(),
            };
            ((primary, attempts), ops, tally_artifacts, comparators)
        };

        let ((attempted, attempts), mut ops, leftover, comparators) = tokio::select! {
            done = work => done,
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                let (mut ops, payloads) = match scored.get() {
                    Some((ops, artifacts)) => (ops.clone(), artifacts.clone()),
                    None => (ctx.snapshot(), ctx.take_tally().artifacts),
                };
                ops.cost_usd = meter.spent();
                let units_completed = ops.progress.as_ref().map(|p| p.units_completed).unwrap_or(0);
                warn!(run_id = %run.run_id, timeout_s = timeout.as_secs(), "run exceeded its deadline");
                let artifacts = store_artifacts(self.cas.as_ref(), &run.run_id, &payloads).await?;
                return Ok(ExecutionReport {
                    outcome: ExecutionOutcome::Failed {
                        kind: FailureKind::Timeout,
                        diffs: vec![Diff::new(DiffReason::Timeout)
                            .with_message("wall-clock deadline exceeded; harness was terminated")
                            .with_field("timeout_s", timeout.as_secs())
                            .with_field("units_completed", units_completed)],
                    },
                    descriptor: Some(descriptor),
                    ops,
                    artifacts,
                    errors: Vec::new(),
                    attempts: ctx.attempt(),
                    elapsed: started.elapsed(),
                });
            }
        };
        ops.cost_usd = meter.spent();

        let (outcome, artifacts, errors) = match attempted {
            Attempted::Scored(result) => {
                let artifacts = store_artifacts(self.cas.as_ref(), &run.run_id, &result.artifacts).await?;
                let errors = result.errors.clone();
                (self.complete(claim, &descriptor, result, comparators), artifacts, errors)
            }
            Attempted::Failed {
                kind: FailureKind::Validation,
                errors,
                ..
            } => {
                let message = errors.first().cloned().unwrap_or_default();
                (ExecutionOutcome::Invalid { message }, Vec::new(), errors)
            }
            Attempted::Failed { kind, diffs, errors } => {
                let artifacts = store_artifacts(self.cas.as_ref(), &run.run_id, &leftover).await?;
                (ExecutionOutcome::Failed { kind, diffs }, artifacts, errors)
            }
            Attempted::Cancelled => (ExecutionOutcome::Cancelled, Vec::new(), Vec::new()),
        };

        Ok(ExecutionReport {
            outcome,
            descriptor: Some(descriptor),
            ops,
            artifacts,
            errors,
            attempts,
            elapsed: started.elapsed(),
        })
    }

    fn complete(
        &self,
        claim: &ClaimRecord,
        descriptor: &HarnessDescriptor,
        result: RunResult,
        comparators: Vec<ComparatorScore>,
    ) -> ExecutionOutcome {
        let samples = result.samples();
        let ci = match self.config.verdict.interval(
            descriptor.metric_family,
            result.score,
            result.n,
            &samples,
        ) {
            Ok(ci) => ci,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    kind: FailureKind::HarnessLogic,
                    diffs: failure_diffs(
                        FailureKind::HarnessLogic,
                        &format!("score {} is not valid for this metric: {e}", result.score),
                        1,
                        &[],
                    ),
                }
            }
        };
        let observation = Observation {
            score: result.score,
            n: result.n,
            ci: Some(ci.clone()),
            mismatches: settings_mismatches(
                claim.settings.environment_sha.as_deref(),
                result.environment_sha.as_deref(),
                claim.settings.dataset_variant.as_deref(),
                result.dataset_variant.as_deref(),
            ),
            task_breakdown: result.task_breakdown(),
            failures: result.failures(),
        };
        ExecutionOutcome::Completed(Box::new(Completed {
            result,
            ci,
            observation,
            comparators,
        }))
    }

    /// Retry loop for one model. Returns the outcome, the attempts used and
    /// telemetry from the last attempt.
    async fn attempt(
        &self,
        harness: &dyn Harness,
        mut invocation: Invocation,
        ctx: &HarnessContext,
    ) -> (Attempted, u32, OpsTelemetry) {
        let descriptor = harness.descriptor();
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            invocation.attempt = attempt;
            ctx.begin_attempt(attempt);
            let ran = harness.run(&invocation, ctx).await;
            let ops = ctx.snapshot();
            let err = match ran {
                Ok(output) => {
                    let tally = ctx.take_tally();
                    let artifacts = tally.artifacts.clone();
                    return match RunResult::assemble(output, tally, descriptor.metric_family) {
                        Ok(result) => (Attempted::Scored(result), attempt, ops),
                        Err(e) => {
                            // Keep the artifacts for the failure record.
                            for a in artifacts {
                                ctx.add_artifact(a.name, a.content_type, a.data);
                            }
                            (self.failed(e, attempt), attempt, ops)
                        }
                    };
                }
                Err(e) => e,
            };

            let exhausted = ctx.meter().is_exhausted();
            match err {
                HarnessError::BudgetExhausted { .. } => return (self.budget_cut(descriptor, ctx), attempt, ops),
                HarnessError::Cancelled if exhausted => return (self.budget_cut(descriptor, ctx), attempt, ops),
                HarnessError::Cancelled => return (Attempted::Cancelled, attempt, ops),
                // Whatever the harness raised after cancellation is fallout from it.
                _ if ctx.is_cancelled() && exhausted => return (self.budget_cut(descriptor, ctx), attempt, ops),
                _ if ctx.is_cancelled() => return (Attempted::Cancelled, attempt, ops),
                ref e if e.kind().is_some_and(FailureKind::is_retryable) && retry.should_retry(attempt) => {
                    let delay = retry.delay_after(attempt);
                    METRICS.inc_retries();
                    obs::emit_harness_retry(
                        invocation.run_id.as_str(),
                        attempt,
                        delay.as_millis() as u64,
                        e,
                    );
                    // Units from the failed attempt do not count; spend does.
                    ctx.take_tally();
                    tokio::select! {
                        _ = ctx.cancelled() => return (Attempted::Cancelled, attempt, ops),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return (self.failed(other, attempt), attempt, ops),
            }
        }
    }

    fn failed(&self, err: HarnessError, attempts: u32) -> Attempted {
        let kind = err.kind().unwrap_or(FailureKind::HarnessLogic);
        let message = err.to_string();
        let failures = match err {
            HarnessError::Logic { failures, .. } => failures,
            _ => Vec::new(),
        };
        Attempted::Failed {
            kind,
            diffs: failure_diffs(kind, &message, attempts, &failures),
            errors: std::iter::once(message).chain(failures).collect(),
        }
    }

    /// Budget ran out mid-run: keep a partial result when units stand on
    /// their own, otherwise fail.
    fn budget_cut(&self, descriptor: &HarnessDescriptor, ctx: &HarnessContext) -> Attempted {
        let tally = ctx.take_tally();
        let completed = tally.units.len();
        let planned = tally.total;
        let meter = ctx.meter();
        let message = format!(
            "budget exhausted after {completed} units: spent ${:.4} of ${:.4}",
            meter.spent(),
            meter.budget()
        );

        if descriptor.independent_units {
            let artifacts = tally.artifacts.clone();
            if let Some(result) = RunResult::partial(tally, descriptor.metric_family) {
                return Attempted::Scored(result);
            }
            for a in artifacts {
                ctx.add_artifact(a.name, a.content_type, a.data);
            }
        } else {
            for a in tally.artifacts {
                ctx.add_artifact(a.name, a.content_type, a.data);
            }
        }

        let diff = Diff::new(DiffReason::BudgetExhausted)
            .with_message(message.clone())
            .with_field("units_completed", completed)
            .with_field("units_total", planned)
            .with_field("spent_usd", meter.spent())
            .with_field("unmetered_spend_usd", meter.unmetered())
            .with_field("budget_usd", meter.budget());
        Attempted::Failed {
            kind: FailureKind::BudgetExceeded,
            diffs: vec![diff],
            errors: vec![message],
        }
    }

    /// Score each comparator model on the same harness. A comparator that
    /// fails for any reason is reported without a score.
    async fn run_comparators(
        &self,
        harness: &dyn Harness,
        invocation: &Invocation,
        primary: &HarnessContext,
    ) -> Vec<ComparatorScore> {
        let mut scores = Vec::new();
        for model in &invocation.claim.settings.comparators {
            let model_config = invocation.model.with_name(model.clone());
            let ctx = HarnessContext::new(primary.cancellation().clone(), primary.meter().clone())
                .with_pricing(model_config.clone())
                .with_unit_cost(harness.descriptor().unit_cost_usd);
            let comparator = Invocation {
                model: model_config,
                attempt: 1,
                ..invocation.clone()
            };

            let score = if ctx.is_cancelled() {
                None
            } else {
                match self.attempt(harness, comparator, &ctx).await {
                    (Attempted::Scored(result), _, _) if !result.partial => Some(result.score),
                    (Attempted::Scored(_), _, _) => {
                        debug!(comparator = %model, "comparator cut short by budget");
                        None
                    }
                    (Attempted::Failed { kind, .. }, _, _) => {
                        warn!(comparator = %model, reason = %kind, "comparator run failed");
                        None
                    }
                    (Attempted::Cancelled, _, _) => None,
                }
            };
            scores.push(ComparatorScore {
                model: model.clone(),
                score,
            });
        }
        scores
    }
}
