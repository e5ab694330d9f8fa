//! Turning an [`ExecutionReport`] into the terminal write for a run.
//!
//! Failure states short-circuit classification: only completed, unresolved
//! and invalid runs are labeled. Every outcome built here carries exactly
//! one trace.

use claimscope_state::{
    ClaimRecord, Diff, DiffReason, OpsTelemetry, RunOutcome, RunRecord, RunStatus, StatusLabel,
};

use crate::domain::FailureKind;
use crate::executor::{ExecutionOutcome, ExecutionReport};
use crate::obs;
use crate::trace::TraceRecorder;
use crate::verdict::{classify, Reference, VerdictPolicy};

/// What the claim asserts, in the verdict engine's terms.
pub fn reference_for(claim: &ClaimRecord) -> Reference {
    Reference {
        domain: claim.domain.clone(),
        task: claim.task.clone(),
        reference_score: claim.reference_score,
        comparative: claim.is_comparative(),
        comparators: claim.settings.comparators.clone(),
    }
}

/// Build the terminal outcome for `run`.
///
/// Returns `None` for a cancelled execution: the run goes back to the
/// queue instead of terminating.
pub fn settle(
    report: ExecutionReport,
    run: &RunRecord,
    claim: &ClaimRecord,
    policy: &VerdictPolicy,
) -> Option<RunOutcome> {
    let ExecutionReport {
        outcome,
        descriptor,
        ops,
        artifacts,
        errors,
        ..
    } = report;
    let reference = reference_for(claim);

    let outcome = match outcome {
        ExecutionOutcome::Cancelled => return None,
        ExecutionOutcome::Completed(done) => {
            let mut verdict = classify(
                Some(&done.observation),
                &reference,
                &done.comparators,
                policy,
            );
            if done.result.partial {
                verdict.diffs.push(
                    Diff::new(DiffReason::BudgetExhausted)
                        .with_message("budget ran out; score covers completed units only")
                        .with_field("units_completed", done.result.units.len())
                        .with_field("spent_usd", ops.cost_usd)
                        .with_field("budget_usd", run.budget_usd),
                );
            }
            let recorder = match &descriptor {
                Some(d) => TraceRecorder::for_harness(run, claim, d),
                None => TraceRecorder::guard(run, claim, DiffReason::UnresolvedHarness),
            };
            let trace = recorder
                .ops(&ops)
                .result(&done.result)
                .errors(errors)
                .build();
            RunOutcome {
                status: RunStatus::Succeeded,
                score_value: Some(done.result.score),
                ci: Some(done.ci),
                ops,
                diffs: verdict.diffs,
                status_label: Some(verdict.label),
                artifacts,
                trace,
            }
        }
        ExecutionOutcome::Unresolved => {
            let verdict = classify(None, &reference, &[], policy);
            let ops = OpsTelemetry::default();
            let trace = TraceRecorder::guard(run, claim, DiffReason::UnresolvedHarness)
                .ops(&ops)
                .build();
            RunOutcome {
                status: RunStatus::Succeeded,
                score_value: None,
                ci: None,
                ops,
                diffs: verdict.diffs,
                status_label: Some(verdict.label),
                artifacts: Vec::new(),
                trace,
            }
        }
        ExecutionOutcome::Invalid { message } => {
            let trace = TraceRecorder::guard(run, claim, DiffReason::Validation)
                .ops(&ops)
                .errors(std::iter::once(message.clone()))
                .build();
            RunOutcome {
                status: RunStatus::Succeeded,
                score_value: None,
                ci: None,
                ops,
                diffs: vec![Diff::new(DiffReason::Validation).with_message(message)],
                status_label: Some(StatusLabel::Underspecified),
                artifacts: Vec::new(),
                trace,
            }
        }
        ExecutionOutcome::Failed { kind, diffs } => {
            let recorder = match &descriptor {
                Some(d) => TraceRecorder::for_harness(run, claim, d),
                None => TraceRecorder::guard(run, claim, kind.reason()),
            };
            let trace = recorder.ops(&ops).errors(errors).build();
            failed(ops, diffs, artifacts, trace)
        }
    };

    if let Some(label) = outcome.status_label {
        obs::emit_verdict_classified(
            run.run_id.as_str(),
            label.as_str(),
            outcome.score_value,
            claim.reference_score,
        );
    }
    Some(outcome)
}

fn failed(
    ops: OpsTelemetry,
    diffs: Vec<Diff>,
    artifacts: Vec<claimscope_state::ArtifactRecord>,
    trace: claimscope_state::TraceRecord,
) -> RunOutcome {
    RunOutcome {
        status: RunStatus::Failed,
        score_value: None,
        ci: None,
        ops,
        diffs,
        status_label: None,
        artifacts,
        trace,
    }
}

/// Terminal failure for a run whose lease expired too many times.
/// Keeps whatever telemetry the lost worker last streamed.
pub fn worker_lost(run: &RunRecord, claim: &ClaimRecord) -> RunOutcome {
    let reason = FailureKind::WorkerLost.reason();
    let expiries = run.lease_losses.saturating_add(1);
    let message = format!("lease expired {expiries} times without a terminal result");
    let trace = TraceRecorder::guard(run, claim, reason)
        .ops(&run.ops)
        .errors(std::iter::once(message.clone()))
        .build();
    let diffs = vec![Diff::new(reason)
        .with_message(message)
        .with_field("lease_expiries", expiries)
        .with_field("attempts", run.attempts)];
    failed(run.ops.clone(), diffs, Vec::new(), trace)
}

/// Terminal failure for a run the engine itself could not carry through,
/// e.g. the artifact store rejected the harness output.
pub fn infra_failure(run: &RunRecord, claim: &ClaimRecord, ops: OpsTelemetry, error: &dyn std::fmt::Display) -> RunOutcome {
    let reason = FailureKind::TransientInfra.reason();
    let message = error.to_string();
    let trace = TraceRecorder::guard(run, claim, reason)
        .ops(&ops)
        .errors(std::iter::once(message.clone()))
        .build();
    failed(ops, vec![Diff::new(reason).with_message(message)], Vec::new(), trace)
}
