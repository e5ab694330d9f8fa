//! Verdict classification.
//!
//! [`classify`] is a pure function from an observation, the claim's
//! reference and comparator results to a [`Verdict`]: one status label
//! plus the diagnostic diffs that justify it. The first matching rule wins:
//!
//! 1. `Underspecified`: the harness could not be resolved, or a comparative
//!    claim is missing comparator results.
//! 2. `Not Reproduced`: a comparator scores at or above the claimed model,
//!    or the reference lies above the interval and beyond the margin.
//! 3. `Setting Drift`: a recorded settings mismatch explains a divergence.
//! 4. `Replicated`.

use std::collections::BTreeMap;

use claimscope_state::{CiMethod, ConfidenceInterval, Diff, DiffReason, StatusLabel};
use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::stats::{self, MetricFamily, StatsError};

/// Thresholds and interval methods used by the verdict engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictPolicy {
    pub proportion_method: CiMethod,
    pub continuous_method: CiMethod,
    pub confidence_z: f64,
    /// How far below the reference a score must fall to be Not Reproduced
    pub not_reproduced_margin: f64,
    /// Divergence that counts as drift when a settings mismatch exists
    pub drift_margin: f64,
    pub bootstrap_resamples: usize,
    pub bootstrap_seed: u64,
    pub bootstrap_confidence: f64,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            proportion_method: CiMethod::Wilson,
            continuous_method: CiMethod::Normal,
            confidence_z: 1.96,
            not_reproduced_margin: 0.05,
            drift_margin: 0.02,
            bootstrap_resamples: 1000,
            bootstrap_seed: 1234,
            bootstrap_confidence: 0.95,
        }
    }
}

impl VerdictPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.confidence_z.is_finite() && self.confidence_z > 0.0) {
            return Err(ConfigError::invalid("confidence_z", "must be positive"));
        }
        for (field, value) in [
            ("not_reproduced_margin", self.not_reproduced_margin),
            ("drift_margin", self.drift_margin),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::invalid(field, "must be a non-negative number"));
            }
        }
        if self.proportion_method == CiMethod::Normal {
            return Err(ConfigError::invalid(
                "proportion_method",
                "proportions use wilson or bootstrap",
            ));
        }
        if self.continuous_method == CiMethod::Wilson {
            return Err(ConfigError::invalid(
                "continuous_method",
                "wilson applies to proportions only",
            ));
        }
        if self.bootstrap_resamples == 0 {
            return Err(ConfigError::invalid("bootstrap_resamples", "must be at least 1"));
        }
        if !(self.bootstrap_confidence > 0.0 && self.bootstrap_confidence < 1.0) {
            return Err(ConfigError::invalid("bootstrap_confidence", "must be in (0, 1)"));
        }
        Ok(())
    }

    pub fn method_for(&self, family: MetricFamily) -> CiMethod {
        match family {
            MetricFamily::Proportion => self.proportion_method,
            MetricFamily::Continuous => self.continuous_method,
        }
    }

    /// Interval for an observed score.
    ///
    /// `samples` are per-unit values (0/1 for proportions). Bootstrap falls
    /// back to the family's parametric method when there are no samples.
    pub fn interval(
        &self,
        family: MetricFamily,
        score: f64,
        n: u64,
        samples: &[f64],
    ) -> Result<ConfidenceInterval, StatsError> {
        let method = self.method_for(family);
        match (method, family) {
            (CiMethod::Bootstrap, _) if !samples.is_empty() => stats::bootstrap_interval(
                samples,
                score,
                self.bootstrap_resamples,
                self.bootstrap_seed,
                self.bootstrap_confidence,
            ),
            (_, MetricFamily::Proportion) => stats::wilson_interval(score, n, self.confidence_z),
            (_, MetricFamily::Continuous) => stats::normal_interval(samples, score, self.confidence_z),
        }
    }
}

/// Declared versus observed value of one setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingMismatch {
    pub dimension: String,
    pub declared: String,
    pub observed: String,
}

/// Pass/fail tally for one task or category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTally {
    pub passed: u64,
    pub total: u64,
}

/// What the harness measured for the claimed model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Observation {
    pub score: f64,
    pub n: u64,
    pub ci: Option<ConfidenceInterval>,
    pub mismatches: Vec<SettingMismatch>,
    pub task_breakdown: BTreeMap<String, TaskTally>,
    pub failures: Vec<String>,
}

/// What the claim asserts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reference {
    pub domain: String,
    pub task: String,
    pub reference_score: Option<f64>,
    pub comparative: bool,
    /// Comparator models named by the claim
    pub comparators: Vec<String>,
}

/// A comparator's result on the same harness and dataset. `None` means the
/// comparator run produced no usable score.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparatorScore {
    pub model: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub label: StatusLabel,
    pub diffs: Vec<Diff>,
}

const FAILURE_SAMPLES: usize = 5;

fn baseline_diff(obs: &Observation, reference: Option<f64>) -> Diff {
    let mut diff = Diff::new(DiffReason::Baseline)
        .with_field("observed", obs.score)
        .with_field("n", obs.n);
    if let Some(ci) = &obs.ci {
        diff = diff
            .with_field("ci_lower", ci.lower)
            .with_field("ci_upper", ci.upper)
            .with_field("ci_method", ci.method.to_string());
    }
    match reference {
        Some(r) => diff
            .with_field("reference", r)
            .with_field("delta", obs.score - r),
        None => diff.with_message("claim has no reference score"),
    }
}

fn evidence_diffs(obs: &Observation) -> Vec<Diff> {
    let mut diffs = Vec::new();
    if !obs.task_breakdown.is_empty() {
        let tasks: serde_json::Map<String, serde_json::Value> = obs
            .task_breakdown
            .iter()
            .map(|(task, tally)| {
                (
                    task.clone(),
                    serde_json::json!({ "passed": tally.passed, "total": tally.total }),
                )
            })
            .collect();
        diffs.push(Diff::new(DiffReason::TaskBreakdown).with_field("tasks", tasks));
    }
    if !obs.failures.is_empty() {
        let samples: Vec<String> = obs.failures.iter().take(FAILURE_SAMPLES).cloned().collect();
        diffs.push(
            Diff::new(DiffReason::FailureSummary)
                .with_field("count", obs.failures.len())
                .with_field("samples", samples),
        );
    }
    for m in &obs.mismatches {
        diffs.push(
            Diff::new(DiffReason::SettingMismatch)
                .with_field("dimension", m.dimension.clone())
                .with_field("declared", m.declared.clone())
                .with_field("observed", m.observed.clone()),
        );
    }
    diffs
}

/// Classify one run. Pure: the same inputs always give the same verdict.
///
/// `observation` is `None` when no harness matched the claim.
pub fn classify(
    observation: Option<&Observation>,
    reference: &Reference,
    comparators: &[ComparatorScore],
    policy: &VerdictPolicy,
) -> Verdict {
    let Some(obs) = observation else {
        return Verdict {
            label: StatusLabel::Underspecified,
            diffs: vec![Diff::new(DiffReason::UnresolvedHarness)
                .with_message("no harness registered for this domain and task")
                .with_field("domain", reference.domain.clone())
                .with_field("task", reference.task.clone())],
        };
    };

    let mut diffs = vec![baseline_diff(obs, reference.reference_score)];

    // Raw comparator results, scored or not.
    for c in comparators {
        diffs.push(
            Diff::new(DiffReason::Comparator)
                .with_field("comparator", c.model.clone())
                .with_field("score", c.score),
        );
    }

    // Comparator evidence.
    let mut missing = Vec::new();
    let mut beaten_by = Vec::new();
    if reference.comparative && reference.comparators.is_empty() {
        missing.push(None);
    }
    for model in &reference.comparators {
        match comparators.iter().find(|c| &c.model == model).and_then(|c| c.score) {
            None => missing.push(Some(model.clone())),
            Some(score) => {
                let beats = score >= obs.score;
                let reason = if beats {
                    beaten_by.push(model.clone());
                    DiffReason::ComparisonDeficit
                } else {
                    DiffReason::ComparisonPass
                };
                diffs.push(
                    Diff::new(reason)
                        .with_field("comparator", model.clone())
                        .with_field("comparator_score", score)
                        .with_field("claimed_score", obs.score)
                        .with_field("delta", obs.score - score),
                );
            }
        }
    }
    for model in &missing {
        let diff = Diff::new(DiffReason::MissingComparator);
        diffs.push(match model {
            Some(m) => diff.with_field("comparator", m.clone()),
            None => diff.with_message("comparative claim names no comparator"),
        });
    }
    diffs.extend(evidence_diffs(obs));

    let upper = obs.ci.as_ref().map(|ci| ci.upper).unwrap_or(obs.score);
    let outside_ci = |r: f64| {
        obs.ci
            .as_ref()
            .map(|ci| !ci.contains(r))
            .unwrap_or(r != obs.score)
    };

    let label = if reference.comparative && !missing.is_empty() {
        StatusLabel::Underspecified
    } else if !beaten_by.is_empty() {
        StatusLabel::NotReproduced
    } else if reference
        .reference_score
        .map(|r| r > upper && r - obs.score > policy.not_reproduced_margin)
        .unwrap_or(false)
    {
        StatusLabel::NotReproduced
    } else if !obs.mismatches.is_empty()
        && reference
            .reference_score
            .map(|r| outside_ci(r) || (obs.score - r).abs() > policy.drift_margin)
            .unwrap_or(true)
    {
        StatusLabel::SettingDrift
    } else {
        StatusLabel::Replicated
    };

    Verdict { label, diffs }
}

/// Compare the settings a harness reports against what the claim declared.
pub fn settings_mismatches(
    declared_environment: Option<&str>,
    observed_environment: Option<&str>,
    declared_variant: Option<&str>,
    observed_variant: Option<&str>,
) -> Vec<SettingMismatch> {
    let mut out = Vec::new();
    for (dimension, declared, observed) in [
        ("environment_sha", declared_environment, observed_environment),
        ("dataset_variant", declared_variant, observed_variant),
    ] {
        if let (Some(d), Some(o)) = (declared, observed) {
            if !d.eq_ignore_ascii_case(o) {
                out.push(SettingMismatch {
                    dimension: dimension.to_string(),
                    declared: d.to_string(),
                    observed: o.to_string(),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(score: f64, n: u64) -> Observation {
        let policy = VerdictPolicy::default();
        Observation {
            score,
            n,
            ci: Some(policy.interval(MetricFamily::Proportion, score, n, &[]).unwrap()),
            ..Default::default()
        }
    }

    fn humaneval(reference: f64) -> Reference {
        Reference {
            domain: "coding".to_string(),
            task: "HumanEval".to_string(),
            reference_score: Some(reference),
            ..Default::default()
        }
    }

    fn reasons(v: &Verdict) -> Vec<DiffReason> {
        v.diffs.iter().map(|d| d.reason).collect()
    }

    #[test]
    fn default_policy_is_valid() {
        VerdictPolicy::default().validate().unwrap();
        let bad = VerdictPolicy {
            continuous_method: CiMethod::Wilson,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = VerdictPolicy {
            not_reproduced_margin: f64::NAN,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn score_above_reference_replicates() {
        let v = classify(Some(&observation(0.96, 25)), &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Replicated);
        assert_eq!(v.diffs[0].reason, DiffReason::Baseline);
    }

    #[test]
    fn score_far_below_reference_is_not_reproduced() {
        let v = classify(Some(&observation(0.60, 25)), &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::NotReproduced);
    }

    #[test]
    fn small_shortfall_inside_interval_replicates() {
        let v = classify(Some(&observation(0.90, 25)), &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Replicated);
    }

    #[test]
    fn unresolved_harness_is_underspecified() {
        let v = classify(None, &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Underspecified);
        assert_eq!(reasons(&v), vec![DiffReason::UnresolvedHarness]);
    }

    #[test]
    fn missing_comparator_is_underspecified() {
        let reference = Reference {
            comparative: true,
            comparators: vec!["model-b".to_string()],
            ..humaneval(0.5)
        };
        let v = classify(
            Some(&observation(0.9, 50)),
            &reference,
            &[ComparatorScore {
                model: "model-b".to_string(),
                score: None,
            }],
            &Default::default(),
        );
        assert_eq!(v.label, StatusLabel::Underspecified);
        assert!(reasons(&v).contains(&DiffReason::MissingComparator));

        let nameless = Reference {
            comparative: true,
            ..humaneval(0.5)
        };
        let v = classify(Some(&observation(0.9, 50)), &nameless, &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Underspecified);
    }

    #[test]
    fn comparator_at_or_above_claimed_is_deficit() {
        let reference = Reference {
            comparative: true,
            comparators: vec!["model-b".to_string(), "model-c".to_string()],
            ..humaneval(0.80)
        };
        let comparators = [
            ComparatorScore {
                model: "model-b".to_string(),
                score: Some(0.84),
            },
            ComparatorScore {
                model: "model-c".to_string(),
                score: Some(0.50),
            },
        ];
        let v = classify(Some(&observation(0.84, 50)), &reference, &comparators, &Default::default());
        assert_eq!(v.label, StatusLabel::NotReproduced);
        let deficit = v
            .diffs
            .iter()
            .find(|d| d.reason == DiffReason::ComparisonDeficit)
            .unwrap();
        assert_eq!(deficit.field("comparator").and_then(|v| v.as_str()), Some("model-b"));
        assert!(reasons(&v).contains(&DiffReason::ComparisonPass));
    }

    #[test]
    fn every_comparator_result_is_reported() {
        let reference = Reference {
            comparative: true,
            comparators: vec!["model-b".to_string(), "model-c".to_string()],
            ..humaneval(0.80)
        };
        let comparators = [
            ComparatorScore {
                model: "model-b".to_string(),
                score: Some(0.70),
            },
            ComparatorScore {
                model: "model-c".to_string(),
                score: None,
            },
        ];
        let v = classify(Some(&observation(0.84, 50)), &reference, &comparators, &Default::default());
        let reported: Vec<_> = v
            .diffs
            .iter()
            .filter(|d| d.reason == DiffReason::Comparator)
            .map(|d| (d.field("comparator").cloned(), d.field("score").cloned()))
            .collect();
        assert_eq!(
            reported,
            vec![
                (Some(serde_json::json!("model-b")), Some(serde_json::json!(0.70))),
                (Some(serde_json::json!("model-c")), Some(serde_json::Value::Null)),
            ]
        );
        assert_eq!(v.label, StatusLabel::Underspecified);
    }

    #[test]
    fn mismatch_with_divergence_is_setting_drift() {
        let mut obs = observation(0.88, 200);
        obs.mismatches = settings_mismatches(Some("abc"), Some("def"), None, Some("v2"));
        assert_eq!(obs.mismatches.len(), 1);

        let v = classify(Some(&obs), &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::SettingDrift);
        assert!(reasons(&v).contains(&DiffReason::SettingMismatch));

        // Same mismatch, but the score matches the reference.
        let mut close = observation(0.92, 200);
        close.mismatches = obs.mismatches.clone();
        let v = classify(Some(&close), &humaneval(0.92), &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Replicated);
    }

    #[test]
    fn missing_reference_replicates_with_note() {
        let reference = Reference {
            reference_score: None,
            ..humaneval(0.0)
        };
        let v = classify(Some(&observation(0.4, 10)), &reference, &[], &Default::default());
        assert_eq!(v.label, StatusLabel::Replicated);
        assert!(v.diffs[0].message.is_some());
    }

    #[test]
    fn evidence_diffs_are_attached() {
        let mut obs = observation(0.5, 4);
        obs.task_breakdown.insert("easy".to_string(), TaskTally { passed: 2, total: 2 });
        obs.failures = (0..8).map(|i| format!("case {i} failed")).collect();
        let v = classify(Some(&obs), &humaneval(0.5), &[], &Default::default());
        let summary = v
            .diffs
            .iter()
            .find(|d| d.reason == DiffReason::FailureSummary)
            .unwrap();
        assert_eq!(summary.field("count").and_then(|v| v.as_u64()), Some(8));
        assert_eq!(summary.field("samples").unwrap().as_array().unwrap().len(), 5);
        assert!(reasons(&v).contains(&DiffReason::TaskBreakdown));
    }

    #[test]
    fn classification_is_pure() {
        let obs = observation(0.7, 30);
        let a = classify(Some(&obs), &humaneval(0.8), &[], &Default::default());
        let b = classify(Some(&obs), &humaneval(0.8), &[], &Default::default());
        assert_eq!(a, b);
    }
}
