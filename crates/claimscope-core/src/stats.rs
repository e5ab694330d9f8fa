//! Confidence intervals for observed benchmark scores.
//!
//! Proportion metrics (pass@1, accuracy) default to the Wilson score
//! interval; continuous metrics use a normal approximation or a seeded
//! percentile bootstrap. Every interval returned here is clamped so that it
//! contains the observed value.

use claimscope_state::{CiMethod, ConfidenceInterval};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Shape of a metric, which decides the default interval method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    /// Fraction of units passed, in `[0, 1]`
    #[default]
    Proportion,
    /// Any real-valued mean
    Continuous,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("proportion {0} is outside [0, 1]")]
    InvalidProportion(f64),

    #[error("interval needs at least one trial")]
    ZeroTrials,

    #[error("bootstrap needs a non-empty sample")]
    EmptySample,

    #[error("z must be positive and finite, got {0}")]
    InvalidZ(f64),

    #[error("sample contains a non-finite value")]
    NonFinite,
}

fn check_z(z: f64) -> Result<(), StatsError> {
    if z.is_finite() && z > 0.0 {
        Ok(())
    } else {
        Err(StatsError::InvalidZ(z))
    }
}

fn clamped(lower: f64, upper: f64, observed: f64, method: CiMethod) -> ConfidenceInterval {
    ConfidenceInterval {
        lower: lower.min(observed),
        upper: upper.max(observed),
        method,
    }
}

/// Wilson score interval for `p` observed over `n` trials.
pub fn wilson_interval(p: f64, n: u64, z: f64) -> Result<ConfidenceInterval, StatsError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(StatsError::InvalidProportion(p));
    }
    if n == 0 {
        return Err(StatsError::ZeroTrials);
    }
    check_z(z)?;

    let n = n as f64;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let half = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;

    let lower = (center - half).max(0.0);
    let upper = (center + half).min(1.0);
    Ok(clamped(lower, upper, p, CiMethod::Wilson))
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// `mean ± z·s/√n`. With fewer than two samples the interval collapses to
/// the observed value.
pub fn normal_interval(samples: &[f64], observed: f64, z: f64) -> Result<ConfidenceInterval, StatsError> {
    check_z(z)?;
    if samples.iter().any(|x| !x.is_finite()) {
        return Err(StatsError::NonFinite);
    }
    if samples.len() < 2 {
        return Ok(clamped(observed, observed, observed, CiMethod::Normal));
    }

    let n = samples.len() as f64;
    let m = mean(samples);
    let var = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1.0);
    let half = z * var.sqrt() / n.sqrt();
    Ok(clamped(m - half, m + half, observed, CiMethod::Normal))
}

/// Nearest-rank percentile of an ascending slice; index `round((len-1)·q)`.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted.get(idx).copied()
}

/// Sort a copy and take the 50th and 95th percentiles.
pub fn p50_p95(samples: &[f64]) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some((percentile(&sorted, 0.50)?, percentile(&sorted, 0.95)?))
}

/// Percentile bootstrap of the sample mean.
///
/// The RNG is seeded, so the same sample, resample count and seed always
/// produce the same interval.
pub fn bootstrap_interval(
    samples: &[f64],
    observed: f64,
    resamples: usize,
    seed: u64,
    confidence: f64,
) -> Result<ConfidenceInterval, StatsError> {
    if samples.is_empty() || resamples == 0 {
        return Err(StatsError::EmptySample);
    }
    if samples.iter().any(|x| !x.is_finite()) {
        return Err(StatsError::NonFinite);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len = samples.len();
    let mut means: Vec<f64> = (0..resamples)
        .map(|_| {
            let total: f64 = (0..len).map(|_| samples[rng.gen_range(0..len)]).sum();
            total / len as f64
        })
        .collect();
    means.sort_by(|a, b| a.total_cmp(b));

    let alpha = (1.0 - confidence.clamp(0.0, 1.0)) / 2.0;
    let lower = percentile(&means, alpha).unwrap_or(observed);
    let upper = percentile(&means, 1.0 - alpha).unwrap_or(observed);
    Ok(clamped(lower, upper, observed, CiMethod::Bootstrap))
}
