//! Run scheduler: the public entry points for submitting and reading runs,
//! plus the expired-lease sweep.
//!
//! The queue itself is the persisted run table. `submit_run` only inserts a
//! queued row; workers pick it up through `RunStore::acquire_lease`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use claimscope_state::{
    ArtifactRecord, ClaimId, ClaimRecord, ConfidenceInterval, Diff, ModelConfig, OpsTelemetry,
    RunId, RunRecord, RunStatus, RunStore, StatusLabel, StorageError, TraceId, MAX_TIMEOUT_S,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::domain::ScheduleError;
use crate::metrics::METRICS;
use crate::obs;
use crate::outcome;

/// Read model of one run, as served to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub claim_id: ClaimId,
    pub status: RunStatus,
    pub score_value: Option<f64>,
    pub ci: Option<ConfidenceInterval>,
    pub ops: OpsTelemetry,
    pub diffs: Vec<Diff>,
    pub artifacts: Vec<ArtifactRecord>,
    pub status_label: Option<StatusLabel>,
    pub trace_id: Option<TraceId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One line of a claim's run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub model: String,
    pub status: RunStatus,
    pub score_value: Option<f64>,
    pub status_label: Option<StatusLabel>,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id.clone(),
            model: run.model_config.name.clone(),
            status: run.status,
            score_value: run.score_value,
            status_label: run.status_label,
            cost_usd: run.ops.cost_usd,
            created_at: run.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRuns {
    pub claim: ClaimRecord,
    /// Newest first
    pub runs: Vec<RunSummary>,
}

/// Result of one expired-lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<RunId>,
    pub failed: Vec<RunId>,
}

pub struct RunScheduler {
    store: Arc<dyn RunStore>,
    config: EngineConfig,
}

impl RunScheduler {
    pub fn new(store: Arc<dyn RunStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a claim handed over by intake.
    pub async fn add_claim(&self, claim: ClaimRecord) -> Result<ClaimId, ScheduleError> {
        if claim.claim_id.as_str().trim().is_empty() {
            return Err(ScheduleError::InvalidRequest("claim_id is empty".to_string()));
        }
        if claim.domain.trim().is_empty() || claim.task.trim().is_empty() {
            return Err(ScheduleError::InvalidRequest(
                "claim needs a domain and a task".to_string(),
            ));
        }
        match claim.settings.timeout_s {
            Some(0) => {
                return Err(ScheduleError::InvalidRequest(
                    "timeout_s must be positive".to_string(),
                ))
            }
            Some(t) if t > MAX_TIMEOUT_S => {
                return Err(ScheduleError::InvalidRequest(format!(
                    "timeout_s {t} exceeds the {MAX_TIMEOUT_S}s ceiling"
                )))
            }
            _ => {}
        }
        let claim_id = claim.claim_id.clone();
        self.store.insert_claim(claim).await?;
        Ok(claim_id)
    }

    /// Queue a run for `claim_id`, or return the id of the run already
    /// active for it. Returns without waiting for execution.
    pub async fn submit_run(
        &self,
        claim_id: &ClaimId,
        model_config: ModelConfig,
        budget_usd: f64,
    ) -> Result<RunId, ScheduleError> {
        if !budget_usd.is_finite() || budget_usd < 0.0 {
            return Err(ScheduleError::InvalidRequest(format!(
                "budget_usd must be a non-negative amount, got {budget_usd}"
            )));
        }
        if model_config.name.trim().is_empty() {
            return Err(ScheduleError::InvalidRequest("model name is empty".to_string()));
        }
        let claim = self.store.get_claim(claim_id).await?;
        if let Some(minimum) = self.config.min_budget_for(&claim.domain) {
            if budget_usd < minimum {
                return Err(ScheduleError::BudgetBelowMinimum {
                    domain: claim.domain,
                    budget_usd,
                    minimum_usd: minimum,
                });
            }
        }

        let run = RunRecord::queued(claim.claim_id.clone(), model_config, budget_usd);
        let (run_id, created) = self.store.create_or_get_active_run(run).await?;
        if created {
            METRICS.inc_submitted();
        }
        obs::emit_run_submitted(run_id.as_str(), claim_id.as_str(), created);
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<RunSnapshot, ScheduleError> {
        let run = self.store.get_run(run_id).await?;
        let artifacts = if run.status.is_terminal() {
            self.store.list_artifacts(run_id).await?
        } else {
            Vec::new()
        };
        Ok(RunSnapshot {
            run_id: run.run_id,
            claim_id: run.claim_id,
            status: run.status,
            score_value: run.score_value,
            ci: run.ci,
            ops: run.ops,
            diffs: run.diffs,
            artifacts,
            status_label: run.status_label,
            trace_id: run.trace_id,
            created_at: run.created_at,
            completed_at: run.completed_at,
        })
    }

    pub async fn get_claim_runs(&self, claim_id: &ClaimId) -> Result<ClaimRuns, ScheduleError> {
        let claim = self.store.get_claim(claim_id).await?;
        let runs = self.store.list_runs(claim_id).await?;
        Ok(ClaimRuns {
            claim,
            runs: runs.iter().map(RunSummary::from).collect(),
        })
    }

    /// Reclaim every run whose lease expired at or before `now`.
    ///
    /// A run that still has lease attempts left is handed back to the
    /// queue; otherwise it is failed with reason `worker_lost`. Runs that
    /// finish or renew concurrently are skipped.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport, ScheduleError> {
        let mut report = ReapReport::default();
        for run in self.store.list_expired_leases(now).await? {
            let Some(owner) = run.lease.as_ref().map(|l| l.owner.clone()) else {
                continue;
            };

            // This expiry counts too; released leases (shutdown) do not.
            let losses = run.lease_losses.saturating_add(1);
            if losses < self.config.max_lease_attempts {
                if self.store.reclaim_lease(&run.run_id, &owner, now).await? {
                    METRICS.inc_reclaimed();
                    obs::emit_run_reclaimed(run.run_id.as_str(), losses, true);
                    report.requeued.push(run.run_id);
                }
                continue;
            }

            let claim = match self.store.get_claim(&run.claim_id).await {
                Ok(claim) => claim,
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "expired run has no claim");
                    continue;
                }
            };
            let lost = outcome::worker_lost(&run, &claim);
            match self.store.finalize_run(&run.run_id, &owner, lost).await {
                Ok(_) => {
                    METRICS.inc_reclaimed();
                    METRICS.inc_failed();
                    obs::emit_run_reclaimed(run.run_id.as_str(), losses, false);
                    report.failed.push(run.run_id);
                }
                Err(StorageError::LeaseLost { .. } | StorageError::InvalidRunState { .. }) => {
                    debug!(run_id = %run.run_id, "run settled before the sweep reached it");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimscope_state::{ClaimSettings, MemoryRunStore, Provider};

    fn claim(id: &str, domain: &str) -> ClaimRecord {
        ClaimRecord {
            claim_id: id.into(),
            model: "model-a".to_string(),
            domain: domain.to_string(),
            task: "HumanEval".to_string(),
            metric: "pass@1".to_string(),
            settings: ClaimSettings {
                timeout_s: Some(60),
                ..Default::default()
            },
            reference_score: Some(0.92),
            source_url: None,
            confidence: 0.9,
            created_at: Utc::now(),
        }
    }

    fn model() -> ModelConfig {
        ModelConfig {
            provider: Provider::OpenAi,
            name: "model-a".to_string(),
            api_key_ref: Some("OPENAI_API_KEY".to_string()),
            price_input_per_mtok: None,
            price_output_per_mtok: None,
        }
    }

    async fn scheduler() -> RunScheduler {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let scheduler = RunScheduler::new(store, EngineConfig::default());
        scheduler.add_claim(claim("c1", "coding")).await.unwrap();
        scheduler
    }

    #[tokio::test]
    async fn submit_is_idempotent_while_active() {
        let s = scheduler().await;
        let a = s.submit_run(&"c1".into(), model(), 0.5).await.unwrap();
        let b = s.submit_run(&"c1".into(), model(), 0.5).await.unwrap();
        assert_eq!(a, b);

        let snapshot = s.get_run(&a).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Queued);
        assert_eq!(snapshot.status_label, None);
        assert_eq!(s.get_claim_runs(&"c1".into()).await.unwrap().runs.len(), 1);
    }

    #[tokio::test]
    async fn submit_validates_input() {
        let s = scheduler().await;
        assert!(matches!(
            s.submit_run(&"missing".into(), model(), 0.5).await,
            Err(ScheduleError::ClaimNotFound(_))
        ));
        assert!(matches!(
            s.submit_run(&"c1".into(), model(), -1.0).await,
            Err(ScheduleError::InvalidRequest(_))
        ));
        assert!(matches!(
            s.submit_run(&"c1".into(), model(), f64::NAN).await,
            Err(ScheduleError::InvalidRequest(_))
        ));
        assert!(matches!(
            s.submit_run(&"c1".into(), model(), 0.01).await,
            Err(ScheduleError::BudgetBelowMinimum { .. })
        ));
    }

    #[tokio::test]
    async fn add_claim_rejects_unusable_timeouts() {
        let s = scheduler().await;
        for timeout in [0, MAX_TIMEOUT_S + 1, u64::MAX] {
            let mut c = claim("c-timeout", "coding");
            c.settings.timeout_s = Some(timeout);
            assert!(matches!(
                s.add_claim(c).await,
                Err(ScheduleError::InvalidRequest(_))
            ));
        }
        let mut c = claim("c-week", "coding");
        c.settings.timeout_s = Some(MAX_TIMEOUT_S);
        assert!(s.add_claim(c).await.is_ok());
    }

    #[tokio::test]
    async fn offline_domains_accept_zero_budget() {
        let s = scheduler().await;
        s.add_claim(claim("c2", "gui-agents")).await.unwrap();
        assert!(s.submit_run(&"c2".into(), model(), 0.0).await.is_ok());
    }

    #[tokio::test]
    async fn expired_leases_are_requeued_then_failed() {
        let s = scheduler().await;
        let run_id = s.submit_run(&"c1".into(), model(), 0.5).await.unwrap();
        let store = s.store().clone();
        let grace = std::time::Duration::from_secs(0);
        let mut now = Utc::now();

        for attempt in 1..=3u32 {
            let leased = store.acquire_lease("w1", now, grace).await.unwrap().unwrap();
            assert_eq!(leased.run.attempts, attempt);
            now += chrono::Duration::seconds(61);
            let report = s.reap_expired(now).await.unwrap();
            if attempt < 3 {
                assert_eq!(report.requeued, vec![run_id.clone()]);
                let run = store.get_run(&run_id).await.unwrap();
                assert_eq!(run.status, RunStatus::Running);
                assert!(run.lease.is_none());
            } else {
                assert_eq!(report.failed, vec![run_id.clone()]);
            }
        }

        let snapshot = s.get_run(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.diffs[0].reason, claimscope_state::DiffReason::WorkerLost);
        let trace = store.get_trace(&run_id).await.unwrap();
        assert_eq!(trace.harness_cmd, "guard::worker_lost");

        let again = s.submit_run(&"c1".into(), model(), 0.5).await.unwrap();
        assert_ne!(again, run_id);
    }

    #[tokio::test]
    async fn released_leases_do_not_count_toward_worker_lost() {
        let s = scheduler().await;
        let run_id = s.submit_run(&"c1".into(), model(), 0.5).await.unwrap();
        let store = s.store().clone();
        let grace = std::time::Duration::from_secs(0);
        let now = Utc::now();

        // Two graceful shutdowns in a row.
        for _ in 0..2 {
            store.acquire_lease("w1", now, grace).await.unwrap().unwrap();
            store.release_lease(&run_id, "w1").await.unwrap();
        }
        store.acquire_lease("w2", now, grace).await.unwrap().unwrap();

        let report = s.reap_expired(now + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(report.requeued, vec![run_id.clone()]);
        assert!(report.failed.is_empty());

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempts, 3);
        assert_eq!(run.lease_losses, 1);
        assert!(run.lease.is_none());
    }
}
