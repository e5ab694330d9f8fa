//! Worker pool.
//!
//! Each worker loops: lease the oldest runnable run, execute it while
//! streaming progress (which also renews the lease), settle the report and
//! write the terminal outcome. A reaper task sweeps expired leases. All
//! tasks stop when the pool's cancellation token fires; a run interrupted
//! by shutdown is released back to the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use claimscope_state::{
    lease_expiry, ClaimRecord, LeasedRun, OpsTelemetry, RunId, RunOutcome, RunRecord, RunStatus,
    RunStore, StorageError, StorageResult,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::EngineConfig;
use crate::executor::Executor;
use crate::metrics::METRICS;
use crate::obs;
use crate::outcome;
use crate::scheduler::RunScheduler;

/// One lease-holding worker.
pub struct Worker {
    id: String,
    store: Arc<dyn RunStore>,
    executor: Arc<Executor>,
    config: EngineConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn RunStore>,
        executor: Arc<Executor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            executor,
            config,
        }
    }

    /// Lease and drive at most one run. Returns the run's id, or `None`
    /// when the queue had nothing leasable.
    pub async fn try_once(&self, shutdown: &CancellationToken) -> StorageResult<Option<RunId>> {
        let leased = self
            .store
            .acquire_lease(&self.id, Utc::now(), self.config.lease_grace())
            .await?;
        let Some(LeasedRun { run, claim }) = leased else {
            return Ok(None);
        };
        obs::emit_run_leased(run.run_id.as_str(), &self.id, run.attempts);

        let span = obs::run_span(run.run_id.as_str(), claim.claim_id.as_str());
        self.drive(&run, &claim, shutdown).instrument(span).await?;
        Ok(Some(run.run_id))
    }

    async fn drive(
        &self,
        run: &RunRecord,
        claim: &ClaimRecord,
        shutdown: &CancellationToken,
    ) -> StorageResult<()> {
        let started = Instant::now();
        let run_token = shutdown.child_token();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(run.ops.clone());
        let tx = Arc::new(tx);
        let pump = tokio::spawn(
            self.progress_pump(run, claim, rx, run_token.clone(), lease_lost.clone())
                .in_current_span(),
        );

        let executed = self
            .executor
            .execute(run, claim, &run_token, Some(tx.clone()))
            .await;
        let last_ops = tx.borrow().clone();
        drop(tx);
        if let Err(e) = pump.await {
            warn!(error = %e, "progress task ended abnormally");
        }

        if lease_lost.load(Ordering::SeqCst) {
            warn!(owner = %self.id, "lease lost while executing; leaving run to its new owner");
            return Ok(());
        }

        let outcome = match executed {
            Ok(report) => {
                match outcome::settle(report, run, claim, self.executor.policy()) {
                    Some(outcome) => outcome,
                    None => return self.release(run).await,
                }
            }
            Err(e) => {
                warn!(error = %e, "execution failed inside the engine");
                outcome::infra_failure(run, claim, last_ops, &e)
            }
        };
        self.finalize(run, outcome, started).await
    }

    /// Forward progress snapshots to the store, renewing the lease each
    /// time. Losing the lease cancels the run.
    fn progress_pump(
        &self,
        run: &RunRecord,
        claim: &ClaimRecord,
        mut rx: watch::Receiver<OpsTelemetry>,
        run_token: CancellationToken,
        lease_lost: Arc<AtomicBool>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let store = self.store.clone();
        let owner = self.id.clone();
        let run_id = run.run_id.clone();
        let claim = claim.clone();
        let grace = self.config.lease_grace();
        async move {
            while rx.changed().await.is_ok() {
                let ops = rx.borrow_and_update().clone();
                if let Some(p) = &ops.progress {
                    obs::emit_run_progress(run_id.as_str(), p.units_completed, p.units_total, ops.cost_usd);
                }
                let expires_at = lease_expiry(&claim, Utc::now(), grace);
                match store.record_progress(&run_id, &owner, ops, expires_at).await {
                    Ok(()) => {}
                    Err(StorageError::LeaseLost { .. } | StorageError::InvalidRunState { .. }) => {
                        lease_lost.store(true, Ordering::SeqCst);
                        run_token.cancel();
                        break;
                    }
                    Err(e) => warn!(error = %e, "failed to record progress"),
                }
            }
        }
    }

    async fn release(&self, run: &RunRecord) -> StorageResult<()> {
        match self.store.release_lease(&run.run_id, &self.id).await {
            Ok(()) => {
                obs::emit_run_released(run.run_id.as_str(), &self.id);
                Ok(())
            }
            Err(StorageError::LeaseLost { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn finalize(&self, run: &RunRecord, outcome: RunOutcome, started: Instant) -> StorageResult<()> {
        let status = outcome.status;
        let label = outcome.status_label;
        let cost_usd = outcome.ops.cost_usd;
        let trace_id = outcome.trace.trace_id.clone();
        let harness_cmd = outcome.trace.harness_cmd.clone();

        match self.store.finalize_run(&run.run_id, &self.id, outcome).await {
            Ok(_) => {}
            Err(e @ StorageError::LeaseLost { .. }) => {
                obs::emit_run_finalize_error(run.run_id.as_str(), &e);
                return Ok(());
            }
            Err(e) => {
                obs::emit_run_finalize_error(run.run_id.as_str(), &e);
                return Err(e);
            }
        }

        match status {
            RunStatus::Failed => METRICS.inc_failed(),
            _ => METRICS.inc_completed(),
        }
        obs::emit_run_finished(
            run.run_id.as_str(),
            status.as_str(),
            label.map(|l| l.as_str()),
            started.elapsed().as_millis() as u64,
            cost_usd,
        );
        obs::emit_trace_recorded(run.run_id.as_str(), trace_id.as_str(), &harness_cmd);
        Ok(())
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(worker = %self.id, "worker started");
        while !shutdown.is_cancelled() {
            match self.try_once(&shutdown).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(worker = %self.id, error = %e, "worker iteration failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        debug!(worker = %self.id, "worker stopped");
    }
}

/// Running pool: workers plus the reaper.
pub struct PoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Stop every task and wait for in-flight runs to be released.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for joined in futures::future::join_all(self.tasks).await {
            if let Err(e) = joined {
                warn!(error = %e, "pool task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` workers and a reaper on the current runtime.
    pub fn start(store: Arc<dyn RunStore>, executor: Arc<Executor>, config: EngineConfig) -> PoolHandle {
        let shutdown = CancellationToken::new();
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let mut tasks = Vec::with_capacity(config.workers + 1);

        for i in 0..config.workers {
            let worker = Worker::new(
                format!("worker-{}-{i}", &prefix[..8]),
                store.clone(),
                executor.clone(),
                config.clone(),
            );
            tasks.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        let scheduler = RunScheduler::new(store, config.clone());
        tasks.push(tokio::spawn(reap_loop(scheduler, shutdown.clone())));
        info!(workers = config.workers, "worker pool started");

        PoolHandle { shutdown, tasks }
    }
}

async fn reap_loop(scheduler: RunScheduler, shutdown: CancellationToken) {
    let period = scheduler.config().reap_interval();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        match scheduler.reap_expired(Utc::now()).await {
            Ok(report) if !report.requeued.is_empty() || !report.failed.is_empty() => {
                info!(
                    requeued = report.requeued.len(),
                    failed = report.failed.len(),
                    "reaped expired leases"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "lease sweep failed"),
        }
    }
}
