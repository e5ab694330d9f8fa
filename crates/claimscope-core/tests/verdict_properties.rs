//! Properties of verdict classification over generated observations.

use claimscope_core::stats::{wilson_interval, MetricFamily};
use claimscope_core::{
    classify, ComparatorScore, DiffReason, Observation, Reference, SettingMismatch, StatusLabel,
    VerdictPolicy,
};
use proptest::prelude::*;

fn observation(passed: u64, n: u64, drift: bool) -> Observation {
    let score = passed as f64 / n as f64;
    let policy = VerdictPolicy::default();
    Observation {
        score,
        n,
        ci: Some(policy.interval(MetricFamily::Proportion, score, n, &[]).unwrap()),
        mismatches: if drift {
            vec![SettingMismatch {
                dimension: "environment_sha".to_string(),
                declared: "sha-a".to_string(),
                observed: "sha-b".to_string(),
            }]
        } else {
            Vec::new()
        },
        ..Default::default()
    }
}

fn reference(score: Option<f64>, comparators: Vec<String>) -> Reference {
    Reference {
        domain: "coding".to_string(),
        task: "HumanEval".to_string(),
        reference_score: score,
        comparative: !comparators.is_empty(),
        comparators,
    }
}

fn arb_counts() -> impl Strategy<Value = (u64, u64)> {
    (1u64..500).prop_flat_map(|n| (0..=n, Just(n)))
}

proptest! {
    #[test]
    fn classification_is_deterministic(
        (passed, n) in arb_counts(),
        reference_score in proptest::option::of(0.0f64..=1.0),
        drift in any::<bool>(),
    ) {
        let obs = observation(passed, n, drift);
        let r = reference(reference_score, Vec::new());
        let policy = VerdictPolicy::default();
        prop_assert_eq!(classify(Some(&obs), &r, &[], &policy), classify(Some(&obs), &r, &[], &policy));
    }

    #[test]
    fn wilson_interval_brackets_the_score((passed, n) in arb_counts()) {
        let p = passed as f64 / n as f64;
        let ci = wilson_interval(p, n, 1.96).unwrap();
        prop_assert!(ci.lower >= 0.0 && ci.upper <= 1.0);
        prop_assert!(ci.lower <= p + 1e-12 && p <= ci.upper + 1e-12);
    }

    #[test]
    fn reference_inside_interval_without_drift_is_replicated(
        (passed, n) in arb_counts(),
        t in 0.0f64..=1.0,
    ) {
        let obs = observation(passed, n, false);
        let ci = obs.ci.clone().unwrap();
        let inside = (ci.lower + t * (ci.upper - ci.lower)).min(ci.upper);
        let verdict = classify(Some(&obs), &reference(Some(inside), Vec::new()), &[], &VerdictPolicy::default());
        prop_assert_eq!(verdict.label, StatusLabel::Replicated);
        prop_assert_eq!(verdict.diffs[0].reason, DiffReason::Baseline);
    }

    #[test]
    fn stronger_comparator_always_means_not_reproduced(
        (passed, n) in arb_counts(),
        lead in 0.0f64..=0.5,
        reference_score in proptest::option::of(0.0f64..=1.0),
    ) {
        let obs = observation(passed, n, false);
        let comparator = ComparatorScore {
            model: "model-b".to_string(),
            score: Some((obs.score + lead).min(1.0)),
        };
        let verdict = classify(
            Some(&obs),
            &reference(reference_score, vec!["model-b".to_string()]),
            &[comparator],
            &VerdictPolicy::default(),
        );
        prop_assert_eq!(verdict.label, StatusLabel::NotReproduced);
        prop_assert!(verdict.diffs.iter().any(|d| d.reason == DiffReason::ComparisonDeficit));
    }

    #[test]
    fn missing_comparator_outranks_everything_else(
        (passed, n) in arb_counts(),
        reference_score in proptest::option::of(0.0f64..=1.0),
        drift in any::<bool>(),
    ) {
        let obs = observation(passed, n, drift);
        let missing = ComparatorScore { model: "model-b".to_string(), score: None };
        let verdict = classify(
            Some(&obs),
            &reference(reference_score, vec!["model-b".to_string()]),
            &[missing],
            &VerdictPolicy::default(),
        );
        prop_assert_eq!(verdict.label, StatusLabel::Underspecified);
    }
}
