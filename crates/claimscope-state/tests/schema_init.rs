//! Integration tests for SurrealDB schema initialization

use claimscope_state::migrations::init_schema;
use claimscope_state::{connect, ClaimStore, RunRecord, RunStore, StoreTarget, SurrealRunStore};

#[tokio::test]
async fn init_schema_is_idempotent() {
    let db = connect(&StoreTarget::Memory).await.unwrap();

    // `connect` already ran it once.
    init_schema(&db).await.unwrap();
    init_schema(&db).await.unwrap();
}

#[tokio::test]
async fn store_over_existing_connection_sees_same_tables() {
    let db = connect(&StoreTarget::Memory).await.unwrap();
    let a = SurrealRunStore::from_db(db.clone());
    let b = SurrealRunStore::from_db(db);

    a.insert_claim(claimscope_state::ClaimRecord {
        claim_id: "shared".into(),
        model: "model-a".to_string(),
        domain: "coding".to_string(),
        task: "HumanEval".to_string(),
        metric: "pass@1".to_string(),
        settings: Default::default(),
        reference_score: Some(0.9),
        source_url: None,
        confidence: 0.8,
        created_at: chrono::Utc::now(),
    })
    .await
    .unwrap();

    let claims = b.list_claims().await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].claim_id.as_str(), "shared");
}

#[tokio::test]
async fn time_columns_hold_microseconds() {
    let db = connect(&StoreTarget::Memory).await.unwrap();
    let store = SurrealRunStore::from_db(db.clone());
    let created_at = chrono::Utc::now();
    let claim = claimscope_state::ClaimRecord {
        claim_id: "micros".into(),
        model: "model-a".to_string(),
        domain: "coding".to_string(),
        task: "HumanEval".to_string(),
        metric: "pass@1".to_string(),
        settings: Default::default(),
        reference_score: None,
        source_url: None,
        confidence: 0.8,
        created_at,
    };
    store.insert_claim(claim).await.unwrap();
    let model = claimscope_state::ModelConfig {
        provider: claimscope_state::Provider::OpenAi,
        name: "model-a".to_string(),
        api_key_ref: None,
        price_input_per_mtok: None,
        price_output_per_mtok: None,
    };
    let (run_id, _) = store
        .create_or_get_active_run(RunRecord::queued("micros".into(), model, 1.0))
        .await
        .unwrap();
    let now = chrono::Utc::now();
    let leased = store
        .acquire_lease("w1", now, std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let expires_at = leased.run.lease.unwrap().expires_at;

    let mut res = db
        .query("SELECT created_us FROM claims")
        .query("SELECT lease_expires_us FROM type::thing('runs', $rid)")
        .bind(("rid", run_id.to_string()))
        .await
        .unwrap();
    #[derive(serde::Deserialize)]
    struct ClaimRow {
        created_us: i64,
    }
    #[derive(serde::Deserialize)]
    struct RunRow {
        lease_expires_us: i64,
    }
    let claims: Vec<ClaimRow> = res.take(0).unwrap();
    let runs: Vec<RunRow> = res.take(1).unwrap();
    assert_eq!(claims[0].created_us, created_at.timestamp_micros());
    assert_eq!(runs[0].lease_expires_us, expires_at.timestamp_micros());
}
