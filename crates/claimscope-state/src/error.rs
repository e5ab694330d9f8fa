//! Error types for claimscope-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// Content digest not present in the CAS
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Malformed digest string
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("claim not found: {claim_id}")]
    ClaimNotFound { claim_id: String },

    #[error("claim already exists: {claim_id}")]
    DuplicateClaim { claim_id: String },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("trace not found for run {run_id}")]
    TraceNotFound { run_id: String },

    /// Operation not valid in the run's current status
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// The caller no longer holds the run's lease
    #[error("lease on run {run_id} is not held by {owner}")]
    LeaseLost { run_id: String, owner: String },

    /// A terminal outcome that would violate a run invariant
    #[error("invalid outcome for run {run_id}: {reason}")]
    InvalidOutcome { run_id: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
