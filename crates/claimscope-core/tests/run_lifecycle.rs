//! Run lifecycle through the worker pool: status monotonicity, lease
//! recovery after a lost worker, and concurrent claims.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use claimscope_core::{
    ClaimRecord, ClaimSettings, DiffReason, EngineConfig, Executor, ExecutorConfig, Harness,
    HarnessContext, HarnessDescriptor, HarnessError, HarnessOutput, HarnessRegistry, Invocation,
    ModelConfig, Provider, RunId, RunScheduler, RunStatus, RunStore, UnitOutcome, WorkerPool,
};
use claimscope_state::{MemoryCasStore, MemoryRunStore};

/// Five passing units, 20ms apart.
struct Steady(HarnessDescriptor);

#[async_trait]
impl Harness for Steady {
    fn descriptor(&self) -> &HarnessDescriptor {
        &self.0
    }

    async fn run(&self, _: &Invocation, ctx: &HarnessContext) -> Result<HarnessOutput, HarnessError> {
        ctx.set_total(5);
        for i in 0..5 {
            tokio::select! {
                _ = ctx.cancelled() => return Err(HarnessError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
            ctx.record_unit(UnitOutcome {
                id: format!("episode-{i}"),
                passed: Some(true),
                latency_s: Some(0.02),
                cost_usd: Some(0.01),
                ..Default::default()
            })?;
        }
        Ok(HarnessOutput::default())
    }
}

fn claim(id: &str) -> ClaimRecord {
    ClaimRecord {
        claim_id: id.into(),
        model: "model-a".to_string(),
        domain: "gui-agents".to_string(),
        task: "OSWorld".to_string(),
        metric: "success_rate".to_string(),
        settings: ClaimSettings {
            timeout_s: Some(30),
            ..Default::default()
        },
        reference_score: Some(0.9),
        source_url: None,
        confidence: 0.8,
        created_at: Utc::now(),
    }
}

fn model() -> ModelConfig {
    ModelConfig {
        provider: Provider::Anthropic,
        name: "model-a".to_string(),
        api_key_ref: None,
        price_input_per_mtok: None,
        price_output_per_mtok: None,
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        workers: 3,
        poll_interval_ms: 10,
        reap_interval_ms: 20,
        lease_grace_s: 0,
        ..Default::default()
    }
}

fn setup(config: &EngineConfig) -> (Arc<dyn RunStore>, Arc<Executor>, RunScheduler) {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let mut registry = HarnessRegistry::new();
    registry.register(
        "gui-agents",
        "osworld",
        Arc::new(Steady(HarnessDescriptor::new("osworld", "osworld-runner --episodes 5"))),
    );
    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        Arc::new(MemoryCasStore::new()),
        ExecutorConfig::from(config),
    ));
    let scheduler = RunScheduler::new(store.clone(), config.clone());
    (store, executor, scheduler)
}

async fn wait_terminal(store: &Arc<dyn RunStore>, run_id: &RunId) -> RunStatus {
    let wait = async {
        loop {
            let status = store.get_run(run_id).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("run did not finish in time")
}

#[tokio::test]
async fn observed_status_and_progress_only_move_forward() {
    let config = config();
    let (store, executor, scheduler) = setup(&config);
    scheduler.add_claim(claim("os-1")).await.unwrap();
    let run_id = scheduler.submit_run(&"os-1".into(), model(), 1.0).await.unwrap();

    let watcher = {
        let store = store.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let run = store.get_run(&run_id).await.unwrap();
                let units = run.ops.progress.as_ref().map(|p| p.units_completed).unwrap_or(0);
                seen.push((run.status, units));
                if run.status.is_terminal() {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };
    tokio::task::yield_now().await;

    let pool = WorkerPool::start(store.clone(), executor, config);
    let seen = tokio::time::timeout(Duration::from_secs(10), watcher)
        .await
        .expect("watcher timed out")
        .unwrap();
    pool.shutdown().await;

    assert_eq!(seen.first().map(|s| s.0), Some(RunStatus::Queued));
    assert_eq!(seen.last().map(|s| s.0), Some(RunStatus::Succeeded));
    for pair in seen.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        assert!(
            prev.0 == next.0 || prev.0.can_transition_to(next.0),
            "status went {:?} -> {:?}",
            prev.0,
            next.0
        );
        assert!(next.1 >= prev.1, "progress went {} -> {}", prev.1, next.1);
    }

    let run = store.get_run(&run_id).await.unwrap();
    assert!((run.ops.cost_usd - 0.05).abs() < 1e-9);
    assert_eq!(run.ops.progress.map(|p| p.units_completed), Some(5));
}

#[tokio::test]
async fn orphaned_lease_is_recovered_by_the_pool() {
    let config = config();
    let (store, executor, scheduler) = setup(&config);
    scheduler.add_claim(claim("os-1")).await.unwrap();
    let run_id = scheduler.submit_run(&"os-1".into(), model(), 1.0).await.unwrap();

    // A worker that leased the run a day ago and never came back.
    let long_ago = Utc::now() - chrono::Duration::days(1);
    let ghost = store
        .acquire_lease("ghost", long_ago, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ghost.run.run_id, run_id);

    let pool = WorkerPool::start(store.clone(), executor, config);
    let status = wait_terminal(&store, &run_id).await;
    pool.shutdown().await;

    assert_eq!(status, RunStatus::Succeeded);
    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.attempts, 2);
    assert_ne!(run.lease.map(|l| l.owner).as_deref(), Some("ghost"));
}

#[tokio::test]
async fn run_out_of_lease_attempts_fails_as_worker_lost() {
    let config = EngineConfig {
        max_lease_attempts: 1,
        ..config()
    };
    let (store, executor, scheduler) = setup(&config);
    scheduler.add_claim(claim("os-1")).await.unwrap();
    let run_id = scheduler.submit_run(&"os-1".into(), model(), 1.0).await.unwrap();

    let long_ago = Utc::now() - chrono::Duration::days(1);
    store
        .acquire_lease("ghost", long_ago, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let pool = WorkerPool::start(store.clone(), executor, config);
    let status = wait_terminal(&store, &run_id).await;
    pool.shutdown().await;

    assert_eq!(status, RunStatus::Failed);
    let snapshot = scheduler.get_run(&run_id).await.unwrap();
    assert_eq!(snapshot.status_label, None);
    assert_eq!(snapshot.diffs[0].reason, DiffReason::WorkerLost);
    let trace = store.get_trace(&run_id).await.unwrap();
    assert_eq!(trace.harness_cmd, "guard::worker_lost");
}

#[tokio::test]
async fn pool_drains_many_claims_within_budget() {
    let config = config();
    let (store, executor, scheduler) = setup(&config);
    let mut runs = Vec::new();
    for i in 0..6 {
        let id = format!("os-{i}");
        scheduler.add_claim(claim(&id)).await.unwrap();
        runs.push(scheduler.submit_run(&id.as_str().into(), model(), 0.2).await.unwrap());
    }

    let pool = WorkerPool::start(store.clone(), executor, config);
    for run_id in &runs {
        assert_eq!(wait_terminal(&store, run_id).await, RunStatus::Succeeded);
    }
    pool.shutdown().await;

    for run_id in &runs {
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.attempts, 1);
        assert!(run.ops.cost_usd <= run.budget_usd + 0.001);
        assert!(store.get_trace(run_id).await.is_ok());
    }
}
