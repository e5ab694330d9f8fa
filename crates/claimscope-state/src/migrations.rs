//! SurrealDB schema migrations and initialization
//!
//! Every table stores a JSON `doc` with the full record plus the scalar
//! columns queries filter and sort on.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all Claimscope tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Claimscope SurrealDB schema");

    init_claims_table(db).await?;
    init_runs_table(db).await?;
    init_active_claims_table(db).await?;
    init_artifacts_table(db).await?;
    init_traces_table(db).await?;

    info!("Claimscope schema initialization complete");
    Ok(())
}

async fn run_ddl(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    debug!("Initializing {} table", table);
    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    info!("✓ {} table initialized", table);
    Ok(())
}

/// Schema:
/// ```text
/// TABLE claims {
///   id:          claims:<claim_id>
///   claim_id:    STRING (unique)
///   created_us:  INT
///   doc:         STRING (ClaimRecord JSON)
/// }
/// ```
async fn init_claims_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS claims SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_claim_id ON TABLE claims COLUMNS claim_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_claim_created ON TABLE claims COLUMNS created_us;
    "#;
    run_ddl(db, "claims", sql).await
}

/// Schema:
/// ```text
/// TABLE runs {
///   id:                runs:<run_id>
///   run_id:            STRING (unique)
///   claim_id:          STRING (indexed)
///   status:            STRING (queued | running | succeeded | failed)
///   active:            BOOL   (status is queued or running)
///   leased:            BOOL
///   lease_owner:       STRING ("" when unleased)
///   lease_expires_us:  INT    (0 when unleased)
///   created_us:        INT    (FIFO order)
///   version:           INT    (optimistic concurrency token)
///   doc:               STRING (RunRecord JSON)
/// }
/// ```
///
/// Constraints:
/// - status transitions are forward-only (enforced by `RunRecord` methods)
/// - every write is conditional on `version` (compare-and-swap)
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_claim ON TABLE runs COLUMNS claim_id, created_us;
        DEFINE INDEX IF NOT EXISTS idx_run_queue ON TABLE runs COLUMNS active, leased, created_us;
        DEFINE INDEX IF NOT EXISTS idx_run_lease ON TABLE runs COLUMNS leased, lease_expires_us;
    "#;
    run_ddl(db, "runs", sql).await
}

/// One row per claim with an active run. `CREATE` on an existing id fails,
/// which is what makes submission idempotent.
///
/// ```text
/// TABLE active_claims {
///   id:      active_claims:<claim_id>
///   run_id:  STRING
/// }
/// ```
async fn init_active_claims_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS active_claims SCHEMALESS;
    "#;
    run_ddl(db, "active_claims", sql).await
}

/// Schema:
/// ```text
/// TABLE artifacts {
///   id:           artifacts:<artifact_id>
///   artifact_id:  STRING
///   run_id:       STRING (indexed)
///   claim_id:     STRING (cascade)
///   created_us:   INT
///   doc:          STRING (ArtifactRecord JSON)
/// }
/// ```
async fn init_artifacts_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_artifact_run ON TABLE artifacts COLUMNS run_id, created_us;
        DEFINE INDEX IF NOT EXISTS idx_artifact_claim ON TABLE artifacts COLUMNS claim_id;
    "#;
    run_ddl(db, "artifacts", sql).await
}

/// Write-once: keyed by run id, so a second `CREATE` for the same run fails.
///
/// ```text
/// TABLE traces {
///   id:        traces:<run_id>
///   trace_id:  STRING (unique)
///   run_id:    STRING
///   claim_id:  STRING (cascade)
///   doc:       STRING (TraceRecord JSON)
/// }
/// ```
async fn init_traces_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS traces SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_trace_id ON TABLE traces COLUMNS trace_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_trace_claim ON TABLE traces COLUMNS claim_id;
    "#;
    run_ddl(db, "traces", sql).await
}
