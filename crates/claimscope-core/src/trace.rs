//! Provenance traces.
//!
//! Every terminal run gets exactly one [`TraceRecord`], written in the same
//! atomic update as the terminal status. [`TraceRecorder`] assembles it from
//! the harness identity, the claim's settings and the run's telemetry.

use std::io;
use std::path::Path;

use chrono::Utc;
use claimscope_state::{
    ClaimRecord, DiffReason, LatencyBreakdown, OpsTelemetry, RunRecord, TraceId, TraceRecord,
};
use sha2::{Digest, Sha256};

use crate::harness::{HarnessDescriptor, RunResult};
use crate::stats;

/// SHA-256 over `FILE::<file name>` followed by the file's bytes, for every
/// existing file in `paths`, visited in path order.
pub fn compute_digest<P: AsRef<Path>>(paths: &[P]) -> io::Result<String> {
    let mut files: Vec<&Path> = paths
        .iter()
        .map(AsRef::<Path>::as_ref)
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut hasher = Sha256::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        hasher.update(format!("FILE::{name}").as_bytes());
        hasher.update(std::fs::read(path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Builder for the trace of one run.
pub struct TraceRecorder<'a> {
    run: &'a RunRecord,
    claim: &'a ClaimRecord,
    harness_cmd: String,
    descriptor: Option<&'a HarnessDescriptor>,
    ops: Option<&'a OpsTelemetry>,
    result: Option<&'a RunResult>,
    errors: Vec<String>,
}

impl<'a> TraceRecorder<'a> {
    /// Trace for a run that reached a harness.
    pub fn for_harness(run: &'a RunRecord, claim: &'a ClaimRecord, descriptor: &'a HarnessDescriptor) -> Self {
        Self {
            run,
            claim,
            harness_cmd: descriptor.cmd.clone(),
            descriptor: Some(descriptor),
            ops: None,
            result: None,
            errors: Vec::new(),
        }
    }

    /// Trace for a run settled before any harness ran, e.g.
    /// `guard::unresolved_harness`.
    pub fn guard(run: &'a RunRecord, claim: &'a ClaimRecord, reason: DiffReason) -> Self {
        Self {
            run,
            claim,
            harness_cmd: format!("guard::{reason}"),
            descriptor: None,
            ops: None,
            result: None,
            errors: Vec::new(),
        }
    }

    pub fn ops(mut self, ops: &'a OpsTelemetry) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn result(mut self, result: &'a RunResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn errors(mut self, errors: impl IntoIterator<Item = String>) -> Self {
        self.errors.extend(errors);
        self
    }

    fn params(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut params = match serde_json::to_value(&self.claim.settings) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        params.retain(|_, v| !v.is_null());
        params.insert("model".to_string(), self.run.model_config.name.clone().into());
        params.insert(
            "provider".to_string(),
            self.run.model_config.provider.to_string().into(),
        );
        params.insert("budget_usd".to_string(), self.run.budget_usd.into());
        if let Some(result) = self.result {
            for (k, v) in &result.params {
                params.insert(k.clone(), v.clone());
            }
        }
        params
    }

    fn latency(&self) -> Option<LatencyBreakdown> {
        if let Some(result) = self.result {
            let samples = result.latencies();
            if let Some((p50, p95)) = stats::p50_p95(&samples) {
                return Some(LatencyBreakdown {
                    p50,
                    p95,
                    samples: samples.len(),
                });
            }
        }
        let ops = self.ops?;
        Some(LatencyBreakdown {
            p50: ops.latency_p50_s?,
            p95: ops.latency_p95_s?,
            samples: 0,
        })
    }

    pub fn build(self) -> TraceRecord {
        let seeds = match self.result {
            Some(r) if !r.seeds.is_empty() => r.seeds.clone(),
            _ => self.claim.settings.seed.into_iter().collect(),
        };
        let (tokens_prompt, tokens_output, cost_usd) = match self.ops {
            Some(ops) => (ops.tokens_prompt, ops.tokens_output, ops.cost_usd),
            None => (0, 0, 0.0),
        };
        let d = self.descriptor;
        let params = self.params();
        let latency = self.latency();

        TraceRecord {
            trace_id: TraceId::new(),
            run_id: self.run.run_id.clone(),
            claim_id: self.claim.claim_id.clone(),
            harness_cmd: self.harness_cmd,
            harness_version: d.and_then(|d| d.version.clone()),
            harness_digest: d.and_then(|d| d.digest.clone()),
            dataset_id: d.and_then(|d| d.dataset_id.clone()),
            dataset_commit: d.and_then(|d| d.dataset_commit.clone()),
            dataset_hash: d.and_then(|d| d.dataset_hash.clone()),
            container_digest: d.and_then(|d| d.container_digest.clone()),
            params,
            seeds,
            tokens_prompt,
            tokens_output,
            latency,
            cost_usd,
            errors: self.errors,
            created_at: Utc::now(),
        }
    }
}
