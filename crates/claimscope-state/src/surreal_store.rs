//! SurrealDB-backed `ClaimStore` + `RunStore`
//!
//! Rows keep the full record as JSON in `doc` next to the scalar columns
//! used for filtering. Run writes are compare-and-swap on `version`; the
//! terminal write and submission run inside a single transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::handle::{self, StoreTarget};
use crate::schema::{
    ArtifactRecord, ClaimId, ClaimRecord, OpsTelemetry, RunId, RunOutcome, RunRecord, TraceRecord,
};
use crate::storage_traits::{lease_expiry, ClaimStore, LeasedRun, RunStore, StorageResult};

/// Retries for compare-and-swap writes that lose a race.
const CAS_RETRIES: usize = 5;

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbClaim {
    claim_id: String,
    created_us: i64,
    doc: String,
}

impl DbClaim {
    fn from_record(claim: &ClaimRecord) -> StorageResult<Self> {
        Ok(Self {
            claim_id: claim.claim_id.to_string(),
            created_us: claim.created_at.timestamp_micros(),
            doc: serde_json::to_string(claim)?,
        })
    }

    fn into_record(self) -> StorageResult<ClaimRecord> {
        Ok(serde_json::from_str(&self.doc)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRun {
    run_id: String,
    claim_id: String,
    status: String,
    active: bool,
    leased: bool,
    lease_owner: String,
    lease_expires_us: i64,
    created_us: i64,
    version: i64,
    doc: String,
}

impl DbRun {
    fn from_record(run: &RunRecord, version: i64) -> StorageResult<Self> {
        Ok(Self {
            run_id: run.run_id.to_string(),
            claim_id: run.claim_id.to_string(),
            status: run.status.as_str().to_string(),
            active: run.is_active(),
            leased: run.lease.is_some(),
            lease_owner: run
                .lease
                .as_ref()
                .map(|l| l.owner.clone())
                .unwrap_or_default(),
            lease_expires_us: run
                .lease
                .as_ref()
                .map(|l| l.expires_at.timestamp_micros())
                .unwrap_or(0),
            created_us: run.created_at.timestamp_micros(),
            version,
            doc: serde_json::to_string(run)?,
        })
    }

    fn record(&self) -> StorageResult<RunRecord> {
        Ok(serde_json::from_str(&self.doc)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbArtifact {
    artifact_id: String,
    run_id: String,
    claim_id: String,
    created_us: i64,
    doc: String,
}

impl DbArtifact {
    fn from_record(artifact: &ArtifactRecord, claim_id: &ClaimId) -> StorageResult<Self> {
        Ok(Self {
            artifact_id: artifact.artifact_id.clone(),
            run_id: artifact.run_id.to_string(),
            claim_id: claim_id.to_string(),
            created_us: artifact.created_at.timestamp_micros(),
            doc: serde_json::to_string(artifact)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbTrace {
    trace_id: String,
    run_id: String,
    claim_id: String,
    doc: String,
}

impl DbTrace {
    fn from_record(trace: &TraceRecord) -> StorageResult<Self> {
        Ok(Self {
            trace_id: trace.trace_id.to_string(),
            run_id: trace.run_id.to_string(),
            claim_id: trace.claim_id.to_string(),
            doc: serde_json::to_string(trace)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbActive {
    run_id: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`ClaimStore`] and [`RunStore`].
#[derive(Clone)]
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

impl SurrealRunStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreTarget::Memory).await
    }

    /// Create from environment variables (see [`StoreTarget::from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&StoreTarget::from_env()).await
    }

    pub async fn connect(target: &StoreTarget) -> crate::Result<Self> {
        let db = handle::connect(target).await?;
        info!(target = %target, "SurrealRunStore connected");
        Ok(Self { db })
    }

    /// Wrap an already initialized connection.
    pub fn from_db(db: Surreal<Any>) -> Self {
        Self { db }
    }

    // -- private helpers -----------------------------------------------------

    async fn select_runs(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<Vec<DbRun>> {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await.map_err(backend)?;
        res.take(0).map_err(backend)
    }

    /// Fetch a run row by ID, returning the DB row or RunNotFound.
    async fn fetch_run(&self, run_id: &RunId) -> StorageResult<DbRun> {
        let rows = self
            .select_runs(
                "SELECT * FROM type::thing('runs', $rid)",
                vec![("rid", run_id.to_string().into())],
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Conditional write. Returns false if another writer bumped `version`.
    async fn swap_run(&self, expected_version: i64, run: &RunRecord) -> StorageResult<bool> {
        let row = DbRun::from_record(run, expected_version + 1)?;
        let mut res = self
            .db
            .query("UPDATE type::thing('runs', $rid) CONTENT $row WHERE version = $version RETURN AFTER")
            .bind(("rid", run.run_id.to_string()))
            .bind(("row", row))
            .bind(("version", expected_version))
            .await
            .map_err(backend)?;
        let rows: Vec<DbRun> = res.take(0).map_err(backend)?;
        Ok(!rows.is_empty())
    }

    /// Read-modify-write loop around [`Self::swap_run`].
    async fn update_run<F>(&self, run_id: &RunId, mut apply: F) -> StorageResult<RunRecord>
    where
        F: FnMut(&mut RunRecord) -> StorageResult<()> + Send,
    {
        for _ in 0..CAS_RETRIES {
            let row = self.fetch_run(run_id).await?;
            let mut record = row.record()?;
            apply(&mut record)?;
            if self.swap_run(row.version, &record).await? {
                return Ok(record);
            }
            debug!(run_id = %run_id, "run version changed, retrying");
        }
        Err(StorageError::Backend(format!(
            "run {run_id} kept changing under concurrent writers"
        )))
    }

    async fn active_run_for(&self, claim_id: &ClaimId) -> StorageResult<Option<RunId>> {
        let mut res = self
            .db
            .query("SELECT run_id FROM type::thing('active_claims', $cid)")
            .bind(("cid", claim_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbActive> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(|r| RunId(r.run_id)))
    }
}

#[async_trait]
impl ClaimStore for SurrealRunStore {
    async fn insert_claim(&self, claim: ClaimRecord) -> StorageResult<()> {
        match self.get_claim(&claim.claim_id).await {
            Ok(_) => {
                return Err(StorageError::DuplicateClaim {
                    claim_id: claim.claim_id.to_string(),
                })
            }
            Err(StorageError::ClaimNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let row = DbClaim::from_record(&claim)?;
        self.db
            .query("CREATE type::thing('claims', $cid) CONTENT $row")
            .bind(("cid", claim.claim_id.to_string()))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(|_| StorageError::DuplicateClaim {
                claim_id: claim.claim_id.to_string(),
            })?;
        Ok(())
    }

    async fn get_claim(&self, claim_id: &ClaimId) -> StorageResult<ClaimRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('claims', $cid)")
            .bind(("cid", claim_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbClaim> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ClaimNotFound {
                claim_id: claim_id.to_string(),
            })?
            .into_record()
    }

    async fn list_claims(&self) -> StorageResult<Vec<ClaimRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM claims ORDER BY created_us ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<DbClaim> = res.take(0).map_err(backend)?;
        rows.into_iter().map(DbClaim::into_record).collect()
    }

    async fn delete_claim(&self, claim_id: &ClaimId) -> StorageResult<()> {
        self.get_claim(claim_id).await?;

        let sql = r#"
            BEGIN TRANSACTION;
            DELETE artifacts WHERE claim_id = $cid;
            DELETE traces WHERE claim_id = $cid;
            DELETE runs WHERE claim_id = $cid;
            DELETE type::thing('active_claims', $cid);
            DELETE type::thing('claims', $cid);
            COMMIT TRANSACTION;
        "#;
        self.db
            .query(sql)
            .bind(("cid", claim_id.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        debug!(claim_id = %claim_id, "claim deleted with cascade");
        Ok(())
    }
}

#[async_trait]
impl RunStore for SurrealRunStore {
    async fn create_or_get_active_run(&self, run: RunRecord) -> StorageResult<(RunId, bool)> {
        self.get_claim(&run.claim_id).await?;
        let row = DbRun::from_record(&run, 0)?;

        let sql = r#"
            BEGIN TRANSACTION;
            CREATE type::thing('active_claims', $cid) CONTENT { run_id: $rid };
            CREATE type::thing('runs', $rid) CONTENT $row;
            COMMIT TRANSACTION;
        "#;

        let mut last_err = String::new();
        for _ in 0..CAS_RETRIES {
            if let Some(existing) = self.active_run_for(&run.claim_id).await? {
                return Ok((existing, false));
            }
            let res = self
                .db
                .query(sql)
                .bind(("cid", run.claim_id.to_string()))
                .bind(("rid", run.run_id.to_string()))
                .bind(("row", row.clone()))
                .await
                .map_err(backend)?;
            match res.check() {
                Ok(_) => return Ok((run.run_id, true)),
                // Lost the race for the claim's active slot, or the slot was
                // freed in between; either way re-read it.
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(StorageError::Backend(last_err))
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.fetch_run(run_id).await?.record()
    }

    async fn list_runs(&self, claim_id: &ClaimId) -> StorageResult<Vec<RunRecord>> {
        let rows = self
            .select_runs(
                "SELECT * FROM runs WHERE claim_id = $cid ORDER BY created_us DESC",
                vec![("cid", claim_id.to_string().into())],
            )
            .await?;
        rows.iter().map(DbRun::record).collect()
    }

    async fn acquire_lease(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StorageResult<Option<LeasedRun>> {
        // Inspect a small window so a lost race falls through to the next run.
        let rows = self
            .select_runs(
                "SELECT * FROM runs WHERE active = true AND leased = false ORDER BY created_us ASC LIMIT 16",
                vec![],
            )
            .await?;

        for row in rows {
            let mut record = row.record()?;
            if !record.is_leasable() {
                continue;
            }
            let claim = self.get_claim(&record.claim_id).await?;
            record.grant_lease(owner, lease_expiry(&claim, now, grace), now)?;
            if self.swap_run(row.version, &record).await? {
                return Ok(Some(LeasedRun { run: record, claim }));
            }
            debug!(run_id = %record.run_id, "lost lease race, trying next run");
        }
        Ok(None)
    }

    async fn record_progress(
        &self,
        run_id: &RunId,
        owner: &str,
        ops: OpsTelemetry,
        lease_expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update_run(run_id, |run| {
            run.apply_progress(owner, ops.clone(), lease_expires_at)
        })
        .await?;
        Ok(())
    }

    async fn release_lease(&self, run_id: &RunId, owner: &str) -> StorageResult<()> {
        self.update_run(run_id, |run| run.release(owner)).await?;
        Ok(())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunRecord>> {
        let rows = self
            .select_runs(
                "SELECT * FROM runs WHERE leased = true AND lease_expires_us <= $now ORDER BY created_us ASC",
                vec![("now", now.timestamp_micros().into())],
            )
            .await?;
        let mut expired = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row.record()?;
            if record.lease_expired(now) {
                expired.push(record);
            }
        }
        Ok(expired)
    }

    async fn reclaim_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        for _ in 0..CAS_RETRIES {
            let row = self.fetch_run(run_id).await?;
            let mut record = row.record()?;
            if !record.expire_lease(owner, now)? {
                return Ok(false);
            }
            if self.swap_run(row.version, &record).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn finalize_run(
        &self,
        run_id: &RunId,
        owner: &str,
        outcome: RunOutcome,
    ) -> StorageResult<RunRecord> {
        let sql = r#"
            BEGIN TRANSACTION;
            LET $updated = (UPDATE type::thing('runs', $rid) CONTENT $row WHERE version = $version RETURN AFTER);
            IF array::len($updated) = 0 { THROW "run version changed"; };
            CREATE type::thing('traces', $rid) CONTENT $trace;
            FOR $a IN $artifacts { CREATE type::thing('artifacts', $a.artifact_id) CONTENT $a; };
            DELETE type::thing('active_claims', $cid) WHERE run_id = $rid;
            COMMIT TRANSACTION;
        "#;

        let trace_row = DbTrace::from_record(&outcome.trace)?;
        let mut last_err = String::new();

        for _ in 0..CAS_RETRIES {
            let row = self.fetch_run(run_id).await?;
            let mut record = row.record()?;
            record.apply_outcome(owner, &outcome, Utc::now())?;

            let artifact_rows = outcome
                .artifacts
                .iter()
                .map(|a| DbArtifact::from_record(a, &record.claim_id))
                .collect::<StorageResult<Vec<_>>>()?;
            let new_row = DbRun::from_record(&record, row.version + 1)?;

            let res = self
                .db
                .query(sql)
                .bind(("rid", run_id.to_string()))
                .bind(("cid", record.claim_id.to_string()))
                .bind(("row", new_row))
                .bind(("version", row.version))
                .bind(("trace", trace_row.clone()))
                .bind(("artifacts", artifact_rows))
                .await
                .map_err(backend)?;

            match res.check() {
                Ok(_) => return Ok(record),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "terminal write rejected, re-reading run");
                    last_err = e.to_string();
                }
            }
        }
        Err(StorageError::Backend(last_err))
    }

    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>> {
        self.fetch_run(run_id).await?;

        let mut res = self
            .db
            .query("SELECT * FROM artifacts WHERE run_id = $rid ORDER BY created_us ASC")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbArtifact> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.doc)?))
            .collect()
    }

    async fn get_trace(&self, run_id: &RunId) -> StorageResult<TraceRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('traces', $rid)")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbTrace> = res.take(0).map_err(backend)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::TraceNotFound {
                run_id: run_id.to_string(),
            })?;
        Ok(serde_json::from_str(&row.doc)?)
    }
}
