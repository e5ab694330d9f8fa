//! Harness contract.
//!
//! A harness is any pinned evaluation procedure (sandboxed test runner,
//! browser driver, scripted LLM benchmark) that can score a model on one
//! `(domain, task)`. The engine talks to every harness through [`Harness`]
//! and never sees benchmark internals: units, telemetry and artifacts are
//! reported through the [`HarnessContext`] and a final [`HarnessOutput`].

mod command;
mod context;
mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use claimscope_state::{ClaimRecord, ModelConfig, RunId};
use serde::{Deserialize, Serialize};

use crate::domain::FailureKind;
use crate::stats::MetricFamily;
use crate::trace::compute_digest;
use crate::verdict::TaskTally;

pub use command::{CommandHarness, CommandSpec};
pub use context::{ArtifactPayload, BudgetMeter, HarnessContext, Tally};
pub use registry::{HarnessRegistry, RegistryEntry, RegistryFile};

/// Pinned identity of a harness, copied into every trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessDescriptor {
    pub name: String,
    /// Command line (or in-process entry point) that produced the score
    pub cmd: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub dataset_commit: Option<String>,
    #[serde(default)]
    pub dataset_hash: Option<String>,
    #[serde(default)]
    pub container_digest: Option<String>,
    /// Each unit can be scored on its own, so a budget cut keeps a partial result
    #[serde(default)]
    pub independent_units: bool,
    #[serde(default)]
    pub metric_family: MetricFamily,
    /// Fixed spend per unit for harnesses that do not bill tokens
    #[serde(default)]
    pub unit_cost_usd: Option<f64>,
    /// Files hashed into `digest` when no digest is pinned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub harness_paths: Vec<PathBuf>,
    /// Files hashed into `dataset_hash` when no hash is pinned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dataset_paths: Vec<PathBuf>,
}

impl HarnessDescriptor {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            version: None,
            digest: None,
            dataset_id: None,
            dataset_commit: None,
            dataset_hash: None,
            container_digest: None,
            independent_units: false,
            metric_family: MetricFamily::Proportion,
            unit_cost_usd: None,
            harness_paths: Vec::new(),
            dataset_paths: Vec::new(),
        }
    }

    /// Fill `digest` and `dataset_hash` from the listed files where they
    /// are not pinned explicitly.
    pub fn resolve_digests(&mut self) -> std::io::Result<()> {
        if self.digest.is_none() && !self.harness_paths.is_empty() {
            self.digest = Some(compute_digest(self.harness_paths.as_slice())?);
        }
        if self.dataset_hash.is_none() && !self.dataset_paths.is_empty() {
            self.dataset_hash = Some(compute_digest(self.dataset_paths.as_slice())?);
        }
        Ok(())
    }
}

/// One call into a harness.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: RunId,
    pub claim: ClaimRecord,
    pub model: ModelConfig,
    pub budget_usd: f64,
    /// 1-based attempt number within the executor's retry loop
    pub attempt: u32,
}

/// Result of one evaluated unit (a problem, episode or test case).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOutcome {
    pub id: String,
    /// Category used for the per-task breakdown
    pub task: Option<String>,
    pub passed: Option<bool>,
    /// Continuous score for this unit
    pub value: Option<f64>,
    pub tokens_prompt: u64,
    pub tokens_output: u64,
    /// Spend reported by the harness; derived from token prices when absent
    pub cost_usd: Option<f64>,
    pub latency_s: Option<f64>,
    pub error: Option<String>,
}

impl UnitOutcome {
    /// Numeric sample used for intervals: pass as 1.0, fail as 0.0.
    pub fn sample(&self) -> Option<f64> {
        match (self.passed, self.value) {
            (Some(p), _) => Some(if p { 1.0 } else { 0.0 }),
            (None, v) => v,
        }
    }
}

/// What a harness hands back when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessOutput {
    /// Aggregate score; derived from recorded units when absent
    pub score: Option<f64>,
    pub n: Option<u64>,
    /// Environment the harness actually ran in
    pub environment_sha: Option<String>,
    pub dataset_variant: Option<String>,
    pub seeds: Vec<u64>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarnessError {
    /// Infrastructure hiccup worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// The harness ran and reported failure
    #[error("harness failed: {message}")]
    Logic {
        message: String,
        failures: Vec<String>,
    },

    #[error("budget exhausted: spent ${spent_usd:.4} of ${budget_usd:.4}")]
    BudgetExhausted { spent_usd: f64, budget_usd: f64 },

    #[error("cancelled")]
    Cancelled,

    /// Inputs the harness cannot work with
    #[error("invalid invocation: {0}")]
    Invalid(String),
}

impl HarnessError {
    pub fn logic(message: impl Into<String>) -> Self {
        HarnessError::Logic {
            message: message.into(),
            failures: Vec::new(),
        }
    }

    /// Failure class; `None` for cancellation, which is not a failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            HarnessError::Transient(_) => Some(FailureKind::TransientInfra),
            HarnessError::Logic { .. } => Some(FailureKind::HarnessLogic),
            HarnessError::BudgetExhausted { .. } => Some(FailureKind::BudgetExceeded),
            HarnessError::Invalid(_) => Some(FailureKind::Validation),
            HarnessError::Cancelled => None,
        }
    }
}

/// Uniform capability every harness variant implements.
#[async_trait]
pub trait Harness: Send + Sync {
    fn descriptor(&self) -> &HarnessDescriptor;

    /// Score `invocation.model` on the claim. Long-running harnesses must
    /// watch `ctx.cancelled()` between units and report each unit through
    /// `ctx.record_unit`.
    async fn run(
        &self,
        invocation: &Invocation,
        ctx: &HarnessContext,
    ) -> Result<HarnessOutput, HarnessError>;
}

/// Engine-side view of a finished invocation: the harness output merged
/// with everything recorded through the context.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub score: f64,
    pub n: u64,
    pub units: Vec<UnitOutcome>,
    pub tokens_prompt: u64,
    pub tokens_output: u64,
    pub artifacts: Vec<ArtifactPayload>,
    pub errors: Vec<String>,
    pub environment_sha: Option<String>,
    pub dataset_variant: Option<String>,
    pub seeds: Vec<u64>,
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Set when the budget cut the run short
    pub partial: bool,
}

impl RunResult {
    /// Merge output and tally. Fails when neither carries a score.
    pub fn assemble(
        output: HarnessOutput,
        tally: Tally,
        family: MetricFamily,
    ) -> Result<Self, HarnessError> {
        let derived = derive_score(&tally.units, family);
        let score = match (output.score, derived) {
            (Some(s), _) => s,
            (None, Some((s, _))) => s,
            (None, None) => {
                return Err(HarnessError::Logic {
                    message: "harness returned no units and no score".to_string(),
                    failures: output.errors,
                })
            }
        };
        if !score.is_finite() {
            return Err(HarnessError::logic(format!("harness returned non-finite score {score}")));
        }
        let n = output
            .n
            .or(derived.map(|(_, n)| n))
            .unwrap_or(tally.units.len() as u64)
            .max(1);

        let mut errors = output.errors;
        errors.extend(tally.units.iter().filter_map(|u| u.error.clone()));

        Ok(Self {
            score,
            n,
            tokens_prompt: tally.tokens_prompt,
            tokens_output: tally.tokens_output,
            units: tally.units,
            artifacts: tally.artifacts,
            errors,
            environment_sha: output.environment_sha.or(tally.environment_sha),
            dataset_variant: output.dataset_variant.or(tally.dataset_variant),
            seeds: output.seeds,
            params: output.params,
            partial: false,
        })
    }

    /// Score whatever units completed before the budget ran out. Settings
    /// come from what the harness observed through the context.
    pub fn partial(tally: Tally, family: MetricFamily) -> Option<Self> {
        let (score, n) = derive_score(&tally.units, family)?;
        let errors = tally.units.iter().filter_map(|u| u.error.clone()).collect();
        Some(Self {
            score,
            n,
            tokens_prompt: tally.tokens_prompt,
            tokens_output: tally.tokens_output,
            units: tally.units,
            artifacts: tally.artifacts,
            errors,
            environment_sha: tally.environment_sha,
            dataset_variant: tally.dataset_variant,
            seeds: Vec::new(),
            params: serde_json::Map::new(),
            partial: true,
        })
    }

    pub fn samples(&self) -> Vec<f64> {
        self.units.iter().filter_map(UnitOutcome::sample).collect()
    }

    pub fn latencies(&self) -> Vec<f64> {
        self.units.iter().filter_map(|u| u.latency_s).collect()
    }

    pub fn task_breakdown(&self) -> BTreeMap<String, TaskTally> {
        let mut out: BTreeMap<String, TaskTally> = BTreeMap::new();
        for unit in &self.units {
            let (Some(task), Some(passed)) = (&unit.task, unit.passed) else {
                continue;
            };
            let tally = out.entry(task.clone()).or_default();
            tally.total += 1;
            if passed {
                tally.passed += 1;
            }
        }
        out
    }

    /// One line per failed unit.
    pub fn failures(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.passed == Some(false) || u.error.is_some())
            .map(|u| match &u.error {
                Some(e) => format!("{}: {}", u.id, e),
                None => format!("{}: failed", u.id),
            })
            .collect()
    }
}

/// Proportion: passed / judged units. Continuous: mean unit value.
fn derive_score(units: &[UnitOutcome], family: MetricFamily) -> Option<(f64, u64)> {
    let values: Vec<f64> = match family {
        MetricFamily::Proportion => units
            .iter()
            .filter_map(|u| u.passed.map(|p| if p { 1.0 } else { 0.0 }))
            .collect(),
        MetricFamily::Continuous => units.iter().filter_map(|u| u.value).collect(),
    };
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    Some((values.iter().sum::<f64>() / n as f64, n as u64))
}
