//! Domain-level error taxonomy for Claimscope.

use claimscope_state::{DiffReason, StateError, StorageError};

use crate::harness::HarnessError;
use crate::stats::StatsError;

/// How a run failed. Each kind maps to one diff reason and one handling
/// policy; raw harness errors never leave the engine in any other form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed input. Labeled `Underspecified`, zero cost.
    Validation,
    /// Infrastructure hiccup. Retried with backoff, then `failed(infra)`.
    TransientInfra,
    /// The harness itself reported failure. Never retried.
    HarnessLogic,
    /// Cost ceiling hit with units that are not independently scoreable.
    BudgetExceeded,
    /// The lease expired too many times.
    WorkerLost,
    /// Wall-clock deadline exceeded.
    Timeout,
}

impl FailureKind {
    pub fn reason(self) -> DiffReason {
        match self {
            FailureKind::Validation => DiffReason::Validation,
            FailureKind::TransientInfra => DiffReason::Infra,
            FailureKind::HarnessLogic => DiffReason::HarnessError,
            FailureKind::BudgetExceeded => DiffReason::BudgetExhausted,
            FailureKind::WorkerLost => DiffReason::WorkerLost,
            FailureKind::Timeout => DiffReason::Timeout,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::TransientInfra)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason().as_str())
    }
}

/// Errors returned by the run scheduler's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("claim not found: {0}")]
    ClaimNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("budget ${budget_usd} is below the ${minimum_usd} minimum for domain {domain}")]
    BudgetBelowMinimum {
        domain: String,
        budget_usd: f64,
        minimum_usd: f64,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ScheduleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ClaimNotFound { claim_id } => ScheduleError::ClaimNotFound(claim_id),
            StorageError::RunNotFound { run_id } => ScheduleError::RunNotFound(run_id),
            other => ScheduleError::Storage(other),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Umbrella error for callers that drive the whole engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("harness error: {0}")]
    Harness(#[from] HarnessError),

    #[error("statistics error: {0}")]
    Stats(#[from] StatsError),
}

/// Result type for engine-level operations.
pub type Result<T> = std::result::Result<T, EngineError>;
