//! Bootstrap estimate of how much the leaderboard score moves with the test sample.
//!
//! The hidden test set is assumed to hold half covers and an even split of the three
//! embedding methods. Every trial draws that exact mix without replacement from a
//! labelled holdout, optionally narrows it to the public-leaderboard share, and scores
//! the result with the weighted AUC.

use std::collections::BTreeSet;

use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::MetricError;
use super::wauc::WeightedAuc;
use crate::shared::progress::{NoopProgress, ProgressObserver, ProgressStage};

/// Class prior of the hidden test set: cover, JMiPOD, JUNIWARD, UERD.
pub const EXPECTED_TEST_DISTRIBUTION: [f64; 4] = [0.5, 0.5 / 3.0, 0.5 / 3.0, 0.5 / 3.0];

/// Rows scored by the public leaderboard.
pub const PUBLIC_LEADERBOARD_SIZE: usize = 1000;

const TRIAL_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Per-class sampling proportions, indexed by label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct ExpectedDistribution {
    priors: Vec<f64>,
}

impl ExpectedDistribution {
    pub fn new(priors: Vec<f64>) -> Result<Self, MetricError> {
        if priors.is_empty() {
            return Err(MetricError::InvalidDistribution(
                "at least one class prior is required".to_string(),
            ));
        }
        if let Some(bad) = priors.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(MetricError::InvalidDistribution(format!(
                "priors must be finite and non-negative, got {bad}"
            )));
        }
        if priors.iter().sum::<f64>() <= 0.0 {
            return Err(MetricError::InvalidDistribution(
                "priors sum to zero".to_string(),
            ));
        }
        Ok(Self { priors })
    }

    pub fn priors(&self) -> &[f64] {
        &self.priors
    }

    pub fn num_classes(&self) -> usize {
        self.priors.len()
    }

    /// Rows drawn per class for a bootstrap of `bootstrap_size`, truncated toward zero.
    /// The counts may sum to slightly less than `bootstrap_size`.
    pub fn class_counts(&self, bootstrap_size: usize) -> Vec<usize> {
        self.priors
            .iter()
            .map(|p| (p * bootstrap_size as f64) as usize)
            .collect()
    }
}

impl Default for ExpectedDistribution {
    fn default() -> Self {
        Self {
            priors: EXPECTED_TEST_DISTRIBUTION.to_vec(),
        }
    }
}

impl TryFrom<Vec<f64>> for ExpectedDistribution {
    type Error = MetricError;

    fn try_from(priors: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(priors)
    }
}

impl From<ExpectedDistribution> for Vec<f64> {
    fn from(distribution: ExpectedDistribution) -> Self {
        distribution.priors
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub trials: usize,
    pub bootstrap_size: usize,
    /// Rows kept from each bootstrap sample. Equal to `bootstrap_size` means keep all.
    pub subsample_size: usize,
    pub distribution: ExpectedDistribution,
    pub seed: u64,
    pub parallel: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            trials: 1000,
            bootstrap_size: 5000,
            subsample_size: 5000,
            distribution: ExpectedDistribution::default(),
            seed: 42,
            parallel: true,
        }
    }
}

impl BootstrapConfig {
    /// The same configuration narrowed to the public-leaderboard share.
    pub fn public(&self) -> Self {
        Self {
            subsample_size: PUBLIC_LEADERBOARD_SIZE,
            ..self.clone()
        }
    }

    fn subsamples(&self) -> bool {
        self.subsample_size != self.bootstrap_size
    }
}

/// Result of [`shaky_wauc`]: every trial score, or only their mean.
#[derive(Clone, Debug, PartialEq)]
pub enum ShakyOutput {
    Scores(Vec<f64>),
    Mean(f64),
}

impl ShakyOutput {
    pub fn mean(&self) -> f64 {
        match self {
            Self::Scores(scores) => scores.iter().sum::<f64>() / scores.len() as f64,
            Self::Mean(mean) => *mean,
        }
    }
}

/// Row indices of every class, plus the draw size per class.
struct ClassPools {
    pools: Vec<Vec<usize>>,
    counts: Vec<usize>,
}

impl ClassPools {
    fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BootstrapEstimator {
    config: BootstrapConfig,
    scorer: WeightedAuc,
}

impl BootstrapEstimator {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            scorer: WeightedAuc::default(),
        }
    }

    pub fn with_scorer(config: BootstrapConfig, scorer: WeightedAuc) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// One weighted AUC per trial, in trial order.
    pub fn estimate(
        &self,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<Vec<f64>, MetricError> {
        self.estimate_with_progress(y_true, y_pred, &NoopProgress)
    }

    pub fn estimate_mean(
        &self,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<f64, MetricError> {
        let scores = self.estimate(y_true, y_pred)?;
        Ok(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    pub fn estimate_with_progress(
        &self,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
        progress: &dyn ProgressObserver,
    ) -> Result<Vec<f64>, MetricError> {
        let pools = self.prepare(y_true, y_pred)?;
        log::debug!(
            "Bootstrapping {} trials of {} rows (class counts {:?}), keeping {}",
            self.config.trials,
            pools.total(),
            pools.counts,
            if self.config.subsamples() {
                self.config.subsample_size
            } else {
                pools.total()
            }
        );

        progress.on_stage_start(ProgressStage::BootstrapTrials, self.config.trials);
        let run = |trial: usize| {
            let score = self.run_trial(trial, &pools, y_true, y_pred);
            progress.on_stage_advance(ProgressStage::BootstrapTrials, 1);
            score
        };
        let scores = if self.config.parallel {
            (0..self.config.trials)
                .into_par_iter()
                .map(run)
                .collect::<Result<Vec<f64>, MetricError>>()
        } else {
            (0..self.config.trials)
                .map(run)
                .collect::<Result<Vec<f64>, MetricError>>()
        };
        progress.on_stage_finish(ProgressStage::BootstrapTrials);
        scores
    }

    fn prepare(
        &self,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<ClassPools, MetricError> {
        if y_true.len() != y_pred.len() {
            return Err(MetricError::LengthMismatch {
                labels: y_true.len(),
                predictions: y_pred.len(),
            });
        }
        if let Some((index, &value)) = y_pred.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(MetricError::NonFinitePrediction { index, value });
        }
        if self.config.trials == 0 {
            return Err(MetricError::NoTrials);
        }

        let distinct: BTreeSet<i64> = y_true.iter().copied().collect();
        if distinct.len() <= 2 {
            return Err(MetricError::TooFewClasses {
                found: distinct.len(),
            });
        }

        let counts = self.config.distribution.class_counts(self.config.bootstrap_size);
        let mut pools = vec![Vec::new(); counts.len()];
        for (row, &label) in y_true.iter().enumerate() {
            if let Ok(class) = usize::try_from(label) {
                if let Some(pool) = pools.get_mut(class) {
                    pool.push(row);
                }
            }
        }
        for (class, (pool, &required)) in pools.iter().zip(counts.iter()).enumerate() {
            if pool.len() < required {
                return Err(MetricError::InsufficientClassSamples {
                    class,
                    available: pool.len(),
                    required,
                });
            }
        }

        let pools = ClassPools { pools, counts };
        if self.config.subsamples() && self.config.subsample_size > pools.total() {
            return Err(MetricError::SubsampleTooLarge {
                requested: self.config.subsample_size,
                available: pools.total(),
            });
        }
        Ok(pools)
    }

    fn run_trial(
        &self,
        trial: usize,
        pools: &ClassPools,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<f64, MetricError> {
        let mut rng = StdRng::seed_from_u64(
            self.config.seed ^ (trial as u64).wrapping_mul(TRIAL_SEED_STRIDE),
        );

        let mut rows = Vec::with_capacity(pools.total());
        for (pool, &count) in pools.pools.iter().zip(pools.counts.iter()) {
            rows.extend(sample(&mut rng, pool.len(), count).iter().map(|i| pool[i]));
        }
        if self.config.subsamples() {
            rows = sample(&mut rng, rows.len(), self.config.subsample_size)
                .iter()
                .map(|i| rows[i])
                .collect();
        }

        let labels: Array1<i64> = rows.iter().map(|&row| y_true[row]).collect();
        let preds: Array1<f64> = rows.iter().map(|&row| y_pred[row]).collect();
        self.scorer.score(labels.view(), preds.view())
    }
}

/// Bootstrapped weighted AUC under `config`. Returns every trial score when
/// `return_scores` is set, otherwise their mean.
pub fn shaky_wauc(
    y_true: ArrayView1<i64>,
    y_pred: ArrayView1<f64>,
    config: &BootstrapConfig,
    return_scores: bool,
) -> Result<ShakyOutput, MetricError> {
    let estimator = BootstrapEstimator::new(config.clone());
    let scores = estimator.estimate(y_true, y_pred)?;
    if return_scores {
        Ok(ShakyOutput::Scores(scores))
    } else {
        Ok(ShakyOutput::Mean(
            scores.iter().sum::<f64>() / scores.len() as f64,
        ))
    }
}

/// [`shaky_wauc`] restricted to [`PUBLIC_LEADERBOARD_SIZE`] rows per trial.
pub fn shaky_wauc_public(
    y_true: ArrayView1<i64>,
    y_pred: ArrayView1<f64>,
    config: &BootstrapConfig,
    return_scores: bool,
) -> Result<ShakyOutput, MetricError> {
    shaky_wauc(y_true, y_pred, &config.public(), return_scores)
}

/// Spread of bootstrap scores. `std` is the population deviation; percentiles interpolate
/// linearly between order statistics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BootstrapSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p05: f64,
    pub p95: f64,
}

impl BootstrapSummary {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let mut sorted = scores.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p05: percentile(&sorted, 5.0),
            p95: percentile(&sorted, 95.0),
        })
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;

    fn synthetic_holdout(per_class: [usize; 4], seed: u64) -> (Array1<i64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut labels = Vec::new();
        let mut preds = Vec::new();
        for (class, &count) in per_class.iter().enumerate() {
            for _ in 0..count {
                let center = if class == 0 { 0.35 } else { 0.65 };
                labels.push(class as i64);
                preds.push(center + rng.gen_range(-0.3..0.3));
            }
        }
        (Array1::from(labels), Array1::from(preds))
    }

    fn small_config(trials: usize) -> BootstrapConfig {
        BootstrapConfig {
            trials,
            bootstrap_size: 120,
            subsample_size: 120,
            ..BootstrapConfig::default()
        }
    }

    #[test]
    fn two_distinct_labels_are_rejected() {
        let y_true = array![0, 0, 1, 1];
        let y_pred = array![0.1, 0.2, 0.3, 0.4];
        let err = shaky_wauc(y_true.view(), y_pred.view(), &BootstrapConfig::default(), false)
            .unwrap_err();
        assert_eq!(err, MetricError::TooFewClasses { found: 2 });
    }

    #[test]
    fn returns_one_bounded_score_per_trial() {
        let (y_true, y_pred) = synthetic_holdout([200, 70, 70, 70], 1);
        let output = shaky_wauc(y_true.view(), y_pred.view(), &small_config(100), true).unwrap();
        let ShakyOutput::Scores(scores) = output else {
            panic!("expected per-trial scores");
        };
        assert_eq!(scores.len(), 100);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        // Overlapping but shifted classes land well above chance.
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        assert!(mean > 0.6, "mean {mean}");
    }

    #[test]
    fn mean_output_matches_scores() {
        let (y_true, y_pred) = synthetic_holdout([200, 70, 70, 70], 2);
        let config = small_config(20);
        let scores = shaky_wauc(y_true.view(), y_pred.view(), &config, true).unwrap();
        let mean = shaky_wauc(y_true.view(), y_pred.view(), &config, false).unwrap();
        assert!(matches!(mean, ShakyOutput::Mean(_)));
        assert_abs_diff_eq!(scores.mean(), mean.mean(), epsilon = 1e-12);
    }

    #[test]
    fn underpopulated_class_is_fatal() {
        let (y_true, y_pred) = synthetic_holdout([200, 70, 10, 70], 3);
        let err = BootstrapEstimator::new(small_config(5))
            .estimate(y_true.view(), y_pred.view())
            .unwrap_err();
        assert_eq!(
            err,
            MetricError::InsufficientClassSamples {
                class: 2,
                available: 10,
                required: 20,
            }
        );
    }

    #[test]
    fn fixed_seed_is_reproducible_across_schedules() {
        let (y_true, y_pred) = synthetic_holdout([200, 70, 70, 70], 4);
        let parallel = BootstrapEstimator::new(small_config(30))
            .estimate(y_true.view(), y_pred.view())
            .unwrap();
        let serial = BootstrapEstimator::new(BootstrapConfig {
            parallel: false,
            ..small_config(30)
        })
        .estimate(y_true.view(), y_pred.view())
        .unwrap();
        assert_eq!(parallel, serial);

        let reseeded = BootstrapEstimator::new(BootstrapConfig {
            seed: 7,
            ..small_config(30)
        })
        .estimate(y_true.view(), y_pred.view())
        .unwrap();
        assert_ne!(parallel, reseeded);
    }

    #[test]
    fn public_variant_subsamples_the_bootstrap() {
        let (y_true, y_pred) = synthetic_holdout([1200, 400, 400, 400], 5);
        let config = BootstrapConfig {
            trials: 10,
            bootstrap_size: 2000,
            subsample_size: 2000,
            ..BootstrapConfig::default()
        };
        let public = config.public();
        assert_eq!(public.subsample_size, PUBLIC_LEADERBOARD_SIZE);

        let output = shaky_wauc_public(y_true.view(), y_pred.view(), &config, true).unwrap();
        let ShakyOutput::Scores(scores) = output else {
            panic!("expected per-trial scores");
        };
        assert_eq!(scores.len(), 10);
    }

    #[test]
    fn subsample_larger_than_bootstrap_is_rejected() {
        let (y_true, y_pred) = synthetic_holdout([200, 70, 70, 70], 6);
        let config = BootstrapConfig {
            subsample_size: 500,
            ..small_config(3)
        };
        let err = BootstrapEstimator::new(config)
            .estimate(y_true.view(), y_pred.view())
            .unwrap_err();
        assert!(matches!(err, MetricError::SubsampleTooLarge { requested: 500, .. }));
    }

    #[test]
    fn class_counts_truncate() {
        let counts = ExpectedDistribution::default().class_counts(5000);
        assert_eq!(counts, vec![2500, 833, 833, 833]);
    }

    #[test]
    fn distribution_rejects_negative_priors() {
        assert!(ExpectedDistribution::new(vec![0.5, -0.1, 0.6]).is_err());
        assert!(ExpectedDistribution::new(vec![]).is_err());
        assert!(ExpectedDistribution::new(vec![0.0, 0.0]).is_err());
    }

    #[test]
    fn summary_statistics() {
        let scores: Vec<f64> = (0..=100).map(|i| i as f64 / 100.0).collect();
        let summary = BootstrapSummary::from_scores(&scores).unwrap();
        assert_abs_diff_eq!(summary.mean, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.min, 0.0);
        assert_abs_diff_eq!(summary.max, 1.0);
        assert_abs_diff_eq!(summary.p05, 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.p95, 0.95, epsilon = 1e-12);
        assert!(BootstrapSummary::from_scores(&[]).is_none());
    }
}
