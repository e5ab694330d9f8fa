//! Storage trait definitions for Claimscope
//!
//! These traits define the core storage abstractions:
//! - `CasStore`: Content-addressed storage for artifact bytes
//! - `ClaimStore`: Claim persistence with cascading delete
//! - `RunStore`: The persisted run queue (leases, progress, terminal writes)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module; `SurrealRunStore` is the database backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{
    ArtifactRecord, ClaimId, ClaimRecord, OpsTelemetry, RunId, RunOutcome, RunRecord, TraceRecord,
    MAX_TIMEOUT_S,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CasStore: content-addressed storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;

    /// Delete content by digest. No-op if absent.
    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ClaimStore
// ---------------------------------------------------------------------------

/// Claim persistence.
///
/// Claims are written once by intake and never mutated. Deleting a claim
/// cascades to its runs, their artifacts and their traces.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Insert a claim. Fails with `DuplicateClaim` if the id is taken.
    async fn insert_claim(&self, claim: ClaimRecord) -> StorageResult<()>;

    async fn get_claim(&self, claim_id: &ClaimId) -> StorageResult<ClaimRecord>;

    /// All claims, oldest first.
    async fn list_claims(&self) -> StorageResult<Vec<ClaimRecord>>;

    /// Delete a claim and everything owned by it.
    async fn delete_claim(&self, claim_id: &ClaimId) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// RunStore: the persisted run queue
// ---------------------------------------------------------------------------

/// A run handed to a worker together with its claim.
#[derive(Debug, Clone)]
pub struct LeasedRun {
    pub run: RunRecord,
    pub claim: ClaimRecord,
}

/// Run persistence and the lease-based work queue.
///
/// Guarantees:
/// - At most one run per claim is active (`queued` or `running`).
/// - Status never moves backwards; terminal runs are immutable.
/// - Only the lease owner may stream progress, release or finalize.
/// - `finalize_run` writes run fields, artifacts and the trace atomically.
#[async_trait]
pub trait RunStore: ClaimStore {
    /// Insert `run` unless its claim already has an active run.
    ///
    /// Returns the id of the active run and whether it was created now.
    async fn create_or_get_active_run(&self, run: RunRecord) -> StorageResult<(RunId, bool)>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Runs of a claim, newest first.
    async fn list_runs(&self, claim_id: &ClaimId) -> StorageResult<Vec<RunRecord>>;

    /// Lease the oldest unleased active run to `owner`.
    ///
    /// Expiry is `now + claim timeout + grace`.
    async fn acquire_lease(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StorageResult<Option<LeasedRun>>;

    /// Replace the run's ops telemetry and push the lease expiry out.
    async fn record_progress(
        &self,
        run_id: &RunId,
        owner: &str,
        ops: OpsTelemetry,
        lease_expires_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Give the run back to the queue without changing its status.
    async fn release_lease(&self, run_id: &RunId, owner: &str) -> StorageResult<()>;

    /// Active runs whose lease expired at or before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunRecord>>;

    /// Release the lease only if `owner` still holds it and it is expired.
    async fn reclaim_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Single atomic terminal transition.
    async fn finalize_run(
        &self,
        run_id: &RunId,
        owner: &str,
        outcome: RunOutcome,
    ) -> StorageResult<RunRecord>;

    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>>;

    async fn get_trace(&self, run_id: &RunId) -> StorageResult<TraceRecord>;
}

/// Lease expiry for a claim, as used by `acquire_lease`.
/// Timeouts beyond [`MAX_TIMEOUT_S`] are clamped to it.
pub fn lease_expiry(claim: &ClaimRecord, now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    let timeout = claim.settings.timeout().min(Duration::from_secs(MAX_TIMEOUT_S));
    let span = timeout.saturating_add(grace);
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
