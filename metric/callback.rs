use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1};

use super::MetricError;
use super::wauc::WeightedAuc;

pub const DEFAULT_CLASS_NAMES: [&str; 4] = ["Cover", "JMiPOD", "JUNIWARD", "UERD"];

/// JPEG quality of each quality-factor category.
pub const QUALITY_LEVELS: [u32; 3] = [75, 90, 95];

/// Collects per-worker buffers from every worker of a distributed run.
///
/// Implementations must return the workers' buffers in rank order; the calling worker's
/// own buffer is one of them.
pub trait AllGather {
    fn all_gather<T: Clone + Send>(&self, local: Vec<T>) -> Vec<Vec<T>>;
}

/// Identity gather for a single process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl AllGather for SingleProcess {
    fn all_gather<T: Clone + Send>(&self, local: Vec<T>) -> Vec<Vec<T>> {
        vec![local]
    }
}

/// Metrics produced at the end of a loader pass.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricReport {
    pub metrics: BTreeMap<String, f64>,
    /// Weighted AUC of cover against each method (columns) per quality factor (rows).
    pub quality_matrix: Option<Array2<f64>>,
    pub samples: usize,
}

impl MetricReport {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Buffers labels and predictions across batches and scores them once the loader ends.
///
/// Predictions must already be probabilities (see [`super::activations`]).
#[derive(Clone, Debug)]
pub struct CompetitionMetricCallback {
    prefix: String,
    class_names: Vec<String>,
    scorer: WeightedAuc,
    true_labels: Vec<i64>,
    pred_labels: Vec<f64>,
    quality_factors: Vec<i64>,
}

impl Default for CompetitionMetricCallback {
    fn default() -> Self {
        Self::new("auc")
    }
}

impl CompetitionMetricCallback {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            class_names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            scorer: WeightedAuc::default(),
            true_labels: Vec::new(),
            pred_labels: Vec::new(),
            quality_factors: Vec::new(),
        }
    }

    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn buffered(&self) -> usize {
        self.true_labels.len()
    }

    pub fn on_loader_start(&mut self) {
        self.true_labels.clear();
        self.pred_labels.clear();
        self.quality_factors.clear();
    }

    pub fn on_batch(
        &mut self,
        predicted: ArrayView1<f64>,
        labels: ArrayView1<i64>,
        quality: Option<ArrayView1<i64>>,
    ) -> Result<(), MetricError> {
        if predicted.len() != labels.len() {
            return Err(MetricError::LengthMismatch {
                labels: labels.len(),
                predictions: predicted.len(),
            });
        }
        if let Some(quality) = quality {
            if quality.len() != labels.len() {
                return Err(MetricError::QualityLengthMismatch {
                    labels: labels.len(),
                    quality: quality.len(),
                });
            }
            self.quality_factors.extend(quality.iter().copied());
        }
        self.true_labels.extend(labels.iter().copied());
        self.pred_labels.extend(predicted.iter().copied());
        Ok(())
    }

    /// Gathers every worker's buffers and computes the overall weighted AUC under the
    /// prefix key. When quality factors were supplied it adds `prefix/qf_75`,
    /// `prefix/qf_90`, `prefix/qf_95` and the quality × method matrix.
    pub fn on_loader_end<G: AllGather>(&mut self, gather: &G) -> Result<MetricReport, MetricError> {
        let true_labels: Vec<i64> = gather
            .all_gather(std::mem::take(&mut self.true_labels))
            .concat();
        let pred_labels: Vec<f64> = gather
            .all_gather(std::mem::take(&mut self.pred_labels))
            .concat();
        let quality_factors: Vec<i64> = gather
            .all_gather(std::mem::take(&mut self.quality_factors))
            .concat();

        if true_labels.len() != pred_labels.len() {
            return Err(MetricError::LengthMismatch {
                labels: true_labels.len(),
                predictions: pred_labels.len(),
            });
        }

        let mut metrics = BTreeMap::new();
        let overall = self.score_where(&true_labels, &pred_labels, |_| true)?;
        metrics.insert(self.prefix.clone(), overall);
        log::debug!("{} = {overall:.6} over {} samples", self.prefix, true_labels.len());

        let mut quality_matrix = None;
        if !quality_factors.is_empty() {
            if quality_factors.len() != true_labels.len() {
                return Err(MetricError::QualityLengthMismatch {
                    labels: true_labels.len(),
                    quality: quality_factors.len(),
                });
            }

            for (qf, level) in QUALITY_LEVELS.iter().enumerate() {
                let score = self.score_where(&true_labels, &pred_labels, |row| {
                    quality_factors[row] == qf as i64
                })?;
                metrics.insert(format!("{}/qf_{level}", self.prefix), score);
            }

            let methods = self.class_names.len().saturating_sub(1);
            let mut matrix = Array2::zeros((QUALITY_LEVELS.len(), methods));
            for qf in 0..QUALITY_LEVELS.len() {
                for method in 0..methods {
                    matrix[[qf, method]] = self.score_where(&true_labels, &pred_labels, |row| {
                        quality_factors[row] == qf as i64
                            && (true_labels[row] == 0 || true_labels[row] == method as i64 + 1)
                    })?;
                }
            }
            quality_matrix = Some(matrix);
        }

        Ok(MetricReport {
            metrics,
            quality_matrix,
            samples: true_labels.len(),
        })
    }

    fn score_where(
        &self,
        true_labels: &[i64],
        pred_labels: &[f64],
        keep: impl Fn(usize) -> bool,
    ) -> Result<f64, MetricError> {
        let (labels, preds): (Vec<i64>, Vec<f64>) = (0..true_labels.len())
            .filter(|&row| keep(row))
            .map(|row| (true_labels[row], pred_labels[row]))
            .unzip();
        self.scorer
            .score(Array1::from(labels).view(), Array1::from(preds).view())
    }
}
