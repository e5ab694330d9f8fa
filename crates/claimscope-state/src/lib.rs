//! Claimscope-State: persistence for the claim reproduction engine
//!
//! This crate owns the records the engine reads and writes: claims, runs,
//! artifacts and traces. It provides the storage traits, an in-memory
//! backend and a SurrealDB backend.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic run transitions, the lease-based run queue and write-once
//! provenance.
//!
//! ## Key Components
//!
//! - `RunStore` / `ClaimStore`: the persisted queue and claim table
//! - `CasStore`: content-addressed artifact bytes
//! - `MemoryRunStore`, `SurrealRunStore`: backends
//! - `RunRecord`: run lifecycle rules shared by all backends

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::{MemoryCasStore, MemoryRunStore};
pub use handle::{connect, CloudConfig, StoreTarget};
pub use schema::{
    ArtifactRecord, CiMethod, ClaimId, ClaimRecord, ClaimSettings, ConfidenceInterval, Diff,
    DiffReason, LatencyBreakdown, Lease, ModelConfig, OpsTelemetry, Progress, Provider, RunId,
    RunOutcome, RunRecord, RunStatus, StatusLabel, TraceId, TraceRecord, DEFAULT_TIMEOUT_S,
    MAX_TIMEOUT_S,
};
pub use storage_traits::{
    lease_expiry, CasStore, ClaimStore, ContentDigest, LeasedRun, RunStore, StorageResult,
};
pub use surreal_store::SurrealRunStore;

/// Result type for claimscope-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
