//! Record types persisted by Claimscope
//!
//! Tables:
//! - claims: immutable benchmark claims (written by intake)
//! - runs: reproduction attempts, leased by workers
//! - artifacts: content-addressed outputs owned by a run
//! - traces: write-once provenance, one per terminal run
//!
//! Run transitions live here as pure methods on [`RunRecord`] so every
//! backend applies exactly the same rules.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ContentDigest, StorageResult};

/// Timeout applied when a claim does not declare `timeout_s`.
pub const DEFAULT_TIMEOUT_S: u64 = 1800;
/// Longest per-run deadline a claim may declare (one week).
pub const MAX_TIMEOUT_S: u64 = 7 * 24 * 60 * 60;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a claim (assigned by intake)
    ClaimId
);
string_id!(
    /// Identifier of a reproduction run
    RunId
);
string_id!(
    /// Identifier of a provenance trace (`trc_<12 hex>`)
    TraceId
);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceId {
    pub fn new() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        TraceId(format!("trc_{}", &hex[..12]))
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Deterministic settings bundle declared by a claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimSettings {
    pub prompt_template: Option<String>,
    pub shots: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub k: Option<u32>,
    pub seed: Option<u64>,
    pub tools: Vec<String>,
    pub timeout_s: Option<u64>,
    pub cot: Option<bool>,
    pub environment_sha: Option<String>,
    pub dataset_variant: Option<String>,
    /// The claim asserts superiority over `comparators`
    pub requires_comparison: bool,
    /// Competing models named by the claim
    pub comparators: Vec<String>,
}

impl ClaimSettings {
    /// Wall-clock deadline for one run of this claim.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S))
    }
}

/// An immutable benchmark claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim_id: ClaimId,
    pub model: String,
    pub domain: String,
    pub task: String,
    pub metric: String,
    #[serde(default)]
    pub settings: ClaimSettings,
    pub reference_score: Option<f64>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ClaimRecord {
    /// Whether the verdict depends on comparator results.
    pub fn is_comparative(&self) -> bool {
        self.settings.requires_comparison || !self.settings.comparators.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Model configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    OpenRouter,
    Vllm,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::OpenRouter => "openrouter",
            Provider::Vllm => "vllm",
        };
        f.write_str(s)
    }
}

/// Model under test. `api_key_ref` names a secret, never the secret itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: Provider,
    pub name: String,
    #[serde(default)]
    pub api_key_ref: Option<String>,
    /// USD per million prompt tokens
    #[serde(default)]
    pub price_input_per_mtok: Option<f64>,
    /// USD per million output tokens
    #[serde(default)]
    pub price_output_per_mtok: Option<f64>,
}

impl ModelConfig {
    /// Same provider and pricing, different model name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Token cost in USD, if this config carries prices.
    pub fn token_cost(&self, tokens_prompt: u64, tokens_output: u64) -> Option<f64> {
        if self.price_input_per_mtok.is_none() && self.price_output_per_mtok.is_none() {
            return None;
        }
        let input = self.price_input_per_mtok.unwrap_or(0.0) * tokens_prompt as f64;
        let output = self.price_output_per_mtok.unwrap_or(0.0) * tokens_output as f64;
        Some((input + output) / 1_000_000.0)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle status of a run: `queued → running → {succeeded, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::Running => 1,
            RunStatus::Succeeded | RunStatus::Failed => 2,
        }
    }

    /// Forward-only check. Staying in a non-terminal status is allowed.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict attached to a succeeded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusLabel {
    Replicated,
    #[serde(rename = "Setting Drift")]
    SettingDrift,
    Underspecified,
    #[serde(rename = "Not Reproduced")]
    NotReproduced,
}

impl StatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLabel::Replicated => "Replicated",
            StatusLabel::SettingDrift => "Setting Drift",
            StatusLabel::Underspecified => "Underspecified",
            StatusLabel::NotReproduced => "Not Reproduced",
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag on a diagnostic diff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    Baseline,
    Comparator,
    TaskBreakdown,
    FailureSummary,
    ComparisonDeficit,
    ComparisonPass,
    MissingComparator,
    SettingMismatch,
    UnresolvedHarness,
    Validation,
    BudgetExhausted,
    Infra,
    HarnessError,
    Timeout,
    WorkerLost,
}

impl DiffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffReason::Baseline => "baseline",
            DiffReason::Comparator => "comparator",
            DiffReason::TaskBreakdown => "task_breakdown",
            DiffReason::FailureSummary => "failure_summary",
            DiffReason::ComparisonDeficit => "comparison_deficit",
            DiffReason::ComparisonPass => "comparison_pass",
            DiffReason::MissingComparator => "missing_comparator",
            DiffReason::SettingMismatch => "setting_mismatch",
            DiffReason::UnresolvedHarness => "unresolved_harness",
            DiffReason::Validation => "validation",
            DiffReason::BudgetExhausted => "budget_exhausted",
            DiffReason::Infra => "infra",
            DiffReason::HarnessError => "harness_error",
            DiffReason::Timeout => "timeout",
            DiffReason::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for DiffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured diagnostic entry attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub reason: DiffReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Diff {
    pub fn new(reason: DiffReason) -> Self {
        Self {
            reason,
            message: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

/// Interval method recorded with the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiMethod {
    Wilson,
    Bootstrap,
    Normal,
}

impl fmt::Display for CiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CiMethod::Wilson => "wilson",
            CiMethod::Bootstrap => "bootstrap",
            CiMethod::Normal => "normal",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CiMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wilson" => Ok(CiMethod::Wilson),
            "bootstrap" => Ok(CiMethod::Bootstrap),
            "normal" => Ok(CiMethod::Normal),
            other => Err(format!("unknown CI method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub method: CiMethod,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub units_completed: u64,
    pub units_total: Option<u64>,
    pub eta_s: Option<f64>,
}

/// Running operational telemetry, streamed while the run executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsTelemetry {
    pub latency_p50_s: Option<f64>,
    pub latency_p95_s: Option<f64>,
    pub tokens_prompt: u64,
    pub tokens_output: u64,
    pub cost_usd: f64,
    pub progress: Option<Progress>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Worker ownership of a non-terminal run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// One reproduction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub claim_id: ClaimId,
    pub model_config: ModelConfig,
    pub budget_usd: f64,
    pub status: RunStatus,
    pub score_value: Option<f64>,
    pub ci: Option<ConfidenceInterval>,
    #[serde(default)]
    pub ops: OpsTelemetry,
    #[serde(default)]
    pub diffs: Vec<Diff>,
    pub status_label: Option<StatusLabel>,
    pub trace_id: Option<TraceId>,
    pub lease: Option<Lease>,
    /// Number of leases granted so far
    #[serde(default)]
    pub attempts: u32,
    /// Leases that expired without a terminal result
    #[serde(default)]
    pub lease_losses: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// A freshly queued run.
    pub fn queued(claim_id: ClaimId, model_config: ModelConfig, budget_usd: f64) -> Self {
        Self {
            run_id: RunId::new(),
            claim_id,
            model_config,
            budget_usd,
            status: RunStatus::Queued,
            score_value: None,
            ci: None,
            ops: OpsTelemetry::default(),
            diffs: Vec::new(),
            status_label: None,
            trace_id: None,
            lease: None,
            attempts: 0,
            lease_losses: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Active and not owned by any worker.
    pub fn is_leasable(&self) -> bool {
        self.is_active() && self.lease.is_none()
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self
                .lease
                .as_ref()
                .map(|l| l.expires_at <= now)
                .unwrap_or(false)
    }

    fn lease_lost(&self, owner: &str) -> StorageError {
        StorageError::LeaseLost {
            run_id: self.run_id.to_string(),
            owner: owner.to_string(),
        }
    }

    /// Fails unless `owner` holds the lease on an active run.
    pub fn check_owner(&self, owner: &str) -> StorageResult<()> {
        if self.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: self.run_id.to_string(),
                status: self.status.to_string(),
                expected: "queued or running".to_string(),
            });
        }
        match &self.lease {
            Some(lease) if lease.owner == owner => Ok(()),
            _ => Err(self.lease_lost(owner)),
        }
    }

    /// Hand the run to `owner`. Status moves to `running`; never backwards.
    pub fn grant_lease(
        &mut self,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        if !self.is_leasable() {
            return Err(StorageError::InvalidRunState {
                run_id: self.run_id.to_string(),
                status: self.status.to_string(),
                expected: "unleased queued or running".to_string(),
            });
        }
        self.status = RunStatus::Running;
        self.started_at.get_or_insert(now);
        self.attempts += 1;
        self.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at,
        });
        Ok(())
    }

    /// Stream telemetry and renew the lease.
    pub fn apply_progress(
        &mut self,
        owner: &str,
        ops: OpsTelemetry,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.check_owner(owner)?;
        self.ops = ops;
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(())
    }

    /// Drop the lease so another worker can pick the run up.
    pub fn release(&mut self, owner: &str) -> StorageResult<()> {
        self.check_owner(owner)?;
        self.lease = None;
        Ok(())
    }

    /// Take back an expired lease. Unlike [`RunRecord::release`], this
    /// counts against the run's lease budget.
    pub fn expire_lease(&mut self, owner: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        if !self.lease_expired(now) || self.check_owner(owner).is_err() {
            return Ok(false);
        }
        self.release(owner)?;
        self.lease_losses += 1;
        Ok(true)
    }

    /// Apply the single terminal transition.
    pub fn apply_outcome(
        &mut self,
        owner: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.check_owner(owner)?;
        outcome.validate(self)?;

        self.status = outcome.status;
        self.score_value = outcome.score_value;
        self.ci = outcome.ci.clone();
        self.ops = outcome.ops.clone();
        self.diffs = outcome.diffs.clone();
        self.status_label = outcome.status_label;
        self.trace_id = Some(outcome.trace.trace_id.clone());
        self.lease = None;
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Everything written atomically when a run reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub score_value: Option<f64>,
    pub ci: Option<ConfidenceInterval>,
    pub ops: OpsTelemetry,
    pub diffs: Vec<Diff>,
    pub status_label: Option<StatusLabel>,
    pub artifacts: Vec<ArtifactRecord>,
    pub trace: TraceRecord,
}

impl RunOutcome {
    /// Check the terminal invariants against the run being finalized.
    pub fn validate(&self, run: &RunRecord) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidOutcome {
            run_id: run.run_id.to_string(),
            reason: reason.to_string(),
        };

        if !self.status.is_terminal() {
            return Err(invalid("outcome status must be terminal"));
        }
        if !run.status.can_transition_to(self.status) {
            return Err(invalid("status transition is not forward"));
        }
        match (self.status, self.status_label) {
            (RunStatus::Succeeded, None) => return Err(invalid("succeeded run needs a label")),
            (RunStatus::Failed, Some(_)) => return Err(invalid("failed run cannot carry a label")),
            _ => {}
        }
        if let (Some(ci), Some(score)) = (&self.ci, self.score_value) {
            if !ci.contains(score) {
                return Err(invalid("confidence interval does not contain the score"));
            }
        }
        if self.trace.run_id != run.run_id {
            return Err(invalid("trace belongs to a different run"));
        }
        if self.artifacts.iter().any(|a| a.run_id != run.run_id) {
            return Err(invalid("artifact belongs to a different run"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Artifacts and traces
// ---------------------------------------------------------------------------

/// Content-addressed output owned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub run_id: RunId,
    pub name: String,
    /// `cas://<sha256>`
    pub url: String,
    pub sha256: ContentDigest,
    pub bytes: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(run_id: RunId, name: impl Into<String>, content_type: impl Into<String>, data: &[u8]) -> Self {
        let sha256 = ContentDigest::from_bytes(data);
        Self {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            name: name.into(),
            url: format!("cas://{}", sha256),
            sha256,
            bytes: data.len() as u64,
            content_type: content_type.into(),
            created_at: Utc::now(),
        }
    }

    /// True when `data` is exactly what this record names.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.bytes == data.len() as u64 && ContentDigest::from_bytes(data) == self.sha256
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub p50: f64,
    pub p95: f64,
    pub samples: usize,
}

/// Write-once provenance for a terminal run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub run_id: RunId,
    pub claim_id: ClaimId,
    pub harness_cmd: String,
    pub harness_version: Option<String>,
    pub harness_digest: Option<String>,
    pub dataset_id: Option<String>,
    pub dataset_commit: Option<String>,
    pub dataset_hash: Option<String>,
    pub container_digest: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub seeds: Vec<u64>,
    pub tokens_prompt: u64,
    pub tokens_output: u64,
    pub latency: Option<LatencyBreakdown>,
    pub cost_usd: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelConfig {
        ModelConfig {
            provider: Provider::OpenAi,
            name: "gpt-4o".to_string(),
            api_key_ref: None,
            price_input_per_mtok: Some(2.0),
            price_output_per_mtok: Some(8.0),
        }
    }

    fn trace_for(run: &RunRecord) -> TraceRecord {
        TraceRecord {
            trace_id: TraceId::new(),
            run_id: run.run_id.clone(),
            claim_id: run.claim_id.clone(),
            harness_cmd: "guard::test".to_string(),
            harness_version: None,
            harness_digest: None,
            dataset_id: None,
            dataset_commit: None,
            dataset_hash: None,
            container_digest: None,
            params: Default::default(),
            seeds: vec![],
            tokens_prompt: 0,
            tokens_output: 0,
            latency: None,
            cost_usd: 0.0,
            errors: vec![],
            created_at: Utc::now(),
        }
    }

    fn outcome(run: &RunRecord, status: RunStatus, label: Option<StatusLabel>) -> RunOutcome {
        RunOutcome {
            status,
            score_value: Some(0.9),
            ci: Some(ConfidenceInterval {
                lower: 0.8,
                upper: 0.95,
                method: CiMethod::Wilson,
            }),
            ops: OpsTelemetry::default(),
            diffs: vec![],
            status_label: label,
            artifacts: vec![],
            trace: trace_for(run),
        }
    }

    #[test]
    fn status_labels_serialize_with_spaces() {
        let json = serde_json::to_string(&StatusLabel::SettingDrift).unwrap();
        assert_eq!(json, "\"Setting Drift\"");
        let back: StatusLabel = serde_json::from_str("\"Not Reproduced\"").unwrap();
        assert_eq!(back, StatusLabel::NotReproduced);
    }

    #[test]
    fn trace_id_format() {
        let id = TraceId::new();
        assert!(id.as_str().starts_with("trc_"));
        assert_eq!(id.as_str().len(), 16);
    }

    #[test]
    fn token_cost_uses_per_million_prices() {
        let cost = model().token_cost(1_000_000, 500_000).unwrap();
        assert!((cost - 6.0).abs() < 1e-9);

        let unpriced = ModelConfig {
            price_input_per_mtok: None,
            price_output_per_mtok: None,
            ..model()
        };
        assert!(unpriced.token_cost(10, 10).is_none());
    }

    #[test]
    fn diff_flattens_fields() {
        let diff = Diff::new(DiffReason::ComparisonDeficit)
            .with_field("comparator", "model-b")
            .with_field("delta", 0.1);
        let value = serde_json::to_value(&diff).unwrap();
        assert_eq!(value["reason"], "comparison_deficit");
        assert_eq!(value["comparator"], "model-b");
    }

    #[test]
    fn lease_moves_status_forward_only() {
        let mut run = RunRecord::queued("c1".into(), model(), 1.0);
        let now = Utc::now();
        run.grant_lease("w1", now, now).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempts, 1);

        run.release("w1").unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.is_leasable());

        run.grant_lease("w2", now, now).unwrap();
        assert_eq!(run.attempts, 2);
        assert!(run.check_owner("w1").is_err());
    }

    #[test]
    fn outcome_requires_label_iff_succeeded() {
        let mut run = RunRecord::queued("c1".into(), model(), 1.0);
        let now = Utc::now();
        run.grant_lease("w1", now, now).unwrap();

        let bad = outcome(&run, RunStatus::Succeeded, None);
        assert!(matches!(
            run.clone().apply_outcome("w1", &bad, now),
            Err(StorageError::InvalidOutcome { .. })
        ));

        let bad = outcome(&run, RunStatus::Failed, Some(StatusLabel::Replicated));
        assert!(run.clone().apply_outcome("w1", &bad, now).is_err());

        let good = outcome(&run, RunStatus::Succeeded, Some(StatusLabel::Replicated));
        run.apply_outcome("w1", &good, now).unwrap();
        assert!(run.status.is_terminal());
        assert!(run.lease.is_none());
        assert!(run.check_owner("w1").is_err());
    }

    #[test]
    fn outcome_rejects_interval_missing_score() {
        let mut run = RunRecord::queued("c1".into(), model(), 1.0);
        let now = Utc::now();
        run.grant_lease("w1", now, now).unwrap();

        let mut out = outcome(&run, RunStatus::Succeeded, Some(StatusLabel::Replicated));
        out.score_value = Some(0.99);
        assert!(run.apply_outcome("w1", &out, now).is_err());
    }

    #[test]
    fn settings_default_timeout() {
        assert_eq!(ClaimSettings::default().timeout(), Duration::from_secs(1800));
        let s = ClaimSettings {
            timeout_s: Some(60),
            ..Default::default()
        };
        assert_eq!(s.timeout(), Duration::from_secs(60));
    }
}
