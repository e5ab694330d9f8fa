//! Claimscope Core Library
//!
//! The claim reproduction engine: a uniform harness contract and registry,
//! an executor that enforces deadlines and cost ceilings, the lease-based
//! run scheduler and worker pool, confidence intervals and verdict
//! classification, and the provenance trace recorder.
//!
//! Persistence lives in `claimscope-state`; this crate only talks to it
//! through the `RunStore` and `CasStore` traits.

pub mod cas;
pub mod config;
pub mod domain;
pub mod executor;
pub mod harness;
pub mod metrics;
pub mod obs;
pub mod outcome;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod trace;
pub mod verdict;
pub mod worker;

pub use cas::{store_artifacts, verify_artifact, FsCasStore};
pub use config::{EngineConfig, LLM_PRICED_DOMAINS};
pub use domain::{ConfigError, EngineError, FailureKind, Result, ScheduleError};
pub use executor::{
    Completed, ExecutionError, ExecutionOutcome, ExecutionReport, Executor, ExecutorConfig,
    RetryPolicy,
};
pub use harness::{
    ArtifactPayload, BudgetMeter, CommandHarness, CommandSpec, Harness, HarnessContext,
    HarnessDescriptor, HarnessError, HarnessOutput, HarnessRegistry, Invocation, RegistryEntry,
    RegistryFile, RunResult, Tally, UnitOutcome,
};
pub use metrics::METRICS;
pub use obs::RunSpan;
pub use outcome::settle;
pub use scheduler::{ClaimRuns, ReapReport, RunScheduler, RunSnapshot, RunSummary};
pub use stats::{MetricFamily, StatsError};
pub use telemetry::init_tracing;
pub use trace::{compute_digest, TraceRecorder};
pub use verdict::{
    classify, ComparatorScore, Observation, Reference, SettingMismatch, TaskTally, Verdict,
    VerdictPolicy,
};
pub use worker::{PoolHandle, Worker, WorkerPool};

pub use claimscope_state::{
    ClaimId, ClaimRecord, ClaimSettings, ConfidenceInterval, Diff, DiffReason, ModelConfig,
    Provider, RunId, RunRecord, RunStatus, RunStore, StatusLabel, TraceRecord,
};
