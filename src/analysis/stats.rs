//! Paired significance tests for predictor correctness.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};

#[derive(Debug, Clone)]
pub struct StatConfig {
    pub bootstrap_resamples: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_resamples: 10_000,
            confidence: 0.95,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McNemarResult {
    /// First right, second wrong.
    pub b: usize,
    /// First wrong, second right.
    pub c: usize,
    pub statistic: f64,
    pub p_value: f64,
}

/// McNemar's test with continuity correction over paired outcomes.
pub fn mcnemar(first: &[bool], second: &[bool]) -> McNemarResult {
    let (mut b, mut c) = (0usize, 0usize);
    for (x, y) in first.iter().zip(second) {
        match (x, y) {
            (true, false) => b += 1,
            (false, true) => c += 1,
            _ => {}
        }
    }

    if b + c == 0 {
        return McNemarResult {
            b,
            c,
            statistic: 0.0,
            p_value: 1.0,
        };
    }

    let diff = (b as f64 - c as f64).abs() - 1.0;
    let statistic = diff.max(0.0).powi(2) / (b + c) as f64;
    let p_value = ChiSquared::new(1.0)
        .map(|dist| dist.sf(statistic))
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);

    McNemarResult {
        b,
        c,
        statistic,
        p_value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResult {
    /// Observed mean accuracy of `second` minus `first`.
    pub mean_delta: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Percentile bootstrap of the accuracy delta (second minus first),
/// resampling paired questions with replacement.
pub fn bootstrap_delta(first: &[bool], second: &[bool], config: &StatConfig) -> BootstrapResult {
    let n = first.len().min(second.len());
    let deltas: Vec<f64> = (0..n)
        .map(|i| f64::from(u8::from(second[i])) - f64::from(u8::from(first[i])))
        .collect();
    let mean_delta = mean(&deltas);
    if n < 2 || config.bootstrap_resamples == 0 {
        return BootstrapResult {
            mean_delta,
            ci_low: mean_delta,
            ci_high: mean_delta,
        };
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut means = Vec::with_capacity(config.bootstrap_resamples);
    for _ in 0..config.bootstrap_resamples {
        let sum: f64 = (0..n).map(|_| deltas[rng.gen_range(0..n)]).sum();
        means.push(sum / n as f64);
    }
    means.sort_by(|a, b| a.total_cmp(b));

    let alpha = 1.0 - config.confidence;
    let last = means.len() - 1;
    let low_idx = ((means.len() as f64) * (alpha / 2.0)).floor() as usize;
    let high_idx = ((means.len() as f64) * (1.0 - alpha / 2.0)).ceil() as usize;

    BootstrapResult {
        mean_delta,
        ci_low: means[low_idx.min(last)],
        ci_high: means[high_idx.min(last)],
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
