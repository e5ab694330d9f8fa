//! In-memory storage backends
//!
//! Provides `MemoryCasStore` and `MemoryRunStore`, which satisfy the trait
//! contracts without any external dependencies. Used by tests and by
//! single-process deployments that do not need durability.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{
    ArtifactRecord, ClaimId, ClaimRecord, OpsTelemetry, RunId, RunOutcome, RunRecord, TraceRecord,
};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCasStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let mut store = self.store.lock().unwrap();
        store.remove(digest.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunSlot {
    /// Insertion order, used for FIFO leasing
    seq: u64,
    record: RunRecord,
}

#[derive(Debug, Default)]
struct Tables {
    next_seq: u64,
    claims: HashMap<ClaimId, (u64, ClaimRecord)>,
    runs: HashMap<RunId, RunSlot>,
    active: HashMap<ClaimId, RunId>,
    artifacts: HashMap<RunId, Vec<ArtifactRecord>>,
    traces: HashMap<RunId, TraceRecord>,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn run_mut(&mut self, run_id: &RunId) -> StorageResult<&mut RunRecord> {
        self.runs
            .get_mut(run_id)
            .map(|slot| &mut slot.record)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }
}

/// In-memory run store. Every operation runs under one mutex, which makes
/// each of them trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    tables: Mutex<Tables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimStore for MemoryRunStore {
    async fn insert_claim(&self, claim: ClaimRecord) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if t.claims.contains_key(&claim.claim_id) {
            return Err(StorageError::DuplicateClaim {
                claim_id: claim.claim_id.to_string(),
            });
        }
        let seq = t.bump();
        t.claims.insert(claim.claim_id.clone(), (seq, claim));
        Ok(())
    }

    async fn get_claim(&self, claim_id: &ClaimId) -> StorageResult<ClaimRecord> {
        let t = self.tables.lock().unwrap();
        t.claims
            .get(claim_id)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| StorageError::ClaimNotFound {
                claim_id: claim_id.to_string(),
            })
    }

    async fn list_claims(&self) -> StorageResult<Vec<ClaimRecord>> {
        let t = self.tables.lock().unwrap();
        let mut claims: Vec<_> = t.claims.values().collect();
        claims.sort_by_key(|(seq, _)| *seq);
        Ok(claims.into_iter().map(|(_, c)| c.clone()).collect())
    }

    async fn delete_claim(&self, claim_id: &ClaimId) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if t.claims.remove(claim_id).is_none() {
            return Err(StorageError::ClaimNotFound {
                claim_id: claim_id.to_string(),
            });
        }
        let owned: Vec<RunId> = t
            .runs
            .values()
            .filter(|slot| &slot.record.claim_id == claim_id)
            .map(|slot| slot.record.run_id.clone())
            .collect();
        for run_id in owned {
            t.runs.remove(&run_id);
            t.artifacts.remove(&run_id);
            t.traces.remove(&run_id);
        }
        t.active.remove(claim_id);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_or_get_active_run(&self, run: RunRecord) -> StorageResult<(RunId, bool)> {
        let mut t = self.tables.lock().unwrap();
        if !t.claims.contains_key(&run.claim_id) {
            return Err(StorageError::ClaimNotFound {
                claim_id: run.claim_id.to_string(),
            });
        }
        if let Some(existing) = t.active.get(&run.claim_id) {
            return Ok((existing.clone(), false));
        }
        let seq = t.bump();
        let run_id = run.run_id.clone();
        t.active.insert(run.claim_id.clone(), run_id.clone());
        t.runs.insert(run_id.clone(), RunSlot { seq, record: run });
        Ok((run_id, true))
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let t = self.tables.lock().unwrap();
        t.runs
            .get(run_id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_runs(&self, claim_id: &ClaimId) -> StorageResult<Vec<RunRecord>> {
        let t = self.tables.lock().unwrap();
        let mut slots: Vec<&RunSlot> = t
            .runs
            .values()
            .filter(|slot| &slot.record.claim_id == claim_id)
            .collect();
        slots.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(slots.into_iter().map(|slot| slot.record.clone()).collect())
    }

    async fn acquire_lease(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StorageResult<Option<LeasedRun>> {
        let mut t = self.tables.lock().unwrap();
        let next = t
            .runs
            .values()
            .filter(|slot| slot.record.is_leasable())
            .min_by_key(|slot| slot.seq)
            .map(|slot| slot.record.run_id.clone());

        let Some(run_id) = next else {
            return Ok(None);
        };

        let claim_id = t.run_mut(&run_id)?.claim_id.clone();
        let claim = t
            .claims
            .get(&claim_id)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| StorageError::ClaimNotFound {
                claim_id: claim_id.to_string(),
            })?;

        let expires_at = lease_expiry(&claim, now, grace);
        let run = t.run_mut(&run_id)?;
        run.grant_lease(owner, expires_at, now)?;
        Ok(Some(LeasedRun {
            run: run.clone(),
            claim,
        }))
    }

    async fn record_progress(
        &self,
        run_id: &RunId,
        owner: &str,
        ops: OpsTelemetry,
        lease_expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.run_mut(run_id)?
            .apply_progress(owner, ops, lease_expires_at)
    }

    async fn release_lease(&self, run_id: &RunId, owner: &str) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.run_mut(run_id)?.release(owner)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunRecord>> {
        let t = self.tables.lock().unwrap();
        let mut slots: Vec<&RunSlot> = t
            .runs
            .values()
            .filter(|slot| slot.record.lease_expired(now))
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        Ok(slots.into_iter().map(|slot| slot.record.clone()).collect())
    }

    async fn reclaim_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut t = self.tables.lock().unwrap();
        t.run_mut(run_id)?.expire_lease(owner, now)
    }

    async fn finalize_run(
        &self,
        run_id: &RunId,
        owner: &str,
        outcome: RunOutcome,
    ) -> StorageResult<RunRecord> {
        let mut t = self.tables.lock().unwrap();
        if t.traces.contains_key(run_id) {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.to_string(),
                status: "traced".to_string(),
                expected: "untraced".to_string(),
            });
        }

        // Apply to a copy first so a rejected outcome leaves no trace.
        let mut updated = t.run_mut(run_id)?.clone();
        updated.apply_outcome(owner, &outcome, Utc::now())?;

        let claim_id = updated.claim_id.clone();
        *t.run_mut(run_id)? = updated.clone();
        t.traces.insert(run_id.clone(), outcome.trace);
        t.artifacts
            .entry(run_id.clone())
            .or_default()
            .extend(outcome.artifacts);
        if t.active.get(&claim_id) == Some(run_id) {
            t.active.remove(&claim_id);
        }
        Ok(updated)
    }

    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>> {
        let t = self.tables.lock().unwrap();
        if !t.runs.contains_key(run_id) {
            return Err(StorageError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(t.artifacts.get(run_id).cloned().unwrap_or_default())
    }

    async fn get_trace(&self, run_id: &RunId) -> StorageResult<TraceRecord> {
        let t = self.tables.lock().unwrap();
        t.traces
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::TraceNotFound {
                run_id: run_id.to_string(),
            })
    }
}
