use ndarray::ArrayView1;

use super::MetricError;

/// A receiver operating characteristic curve.
///
/// Points are ordered by descending threshold, so both rates are non-decreasing.
/// The first point is always `(0, 0)` with an infinite threshold. One point is kept for
/// every distinct score; intermediate collinear points are never dropped, because the
/// weighted AUC clips and shifts the curve before integrating and a simplified curve
/// integrates differently.
#[derive(Clone, Debug, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
    pub positives: usize,
    pub negatives: usize,
}

impl RocCurve {
    /// Builds a curve from explicit rate vectors. Thresholds are synthesized as a
    /// descending index sequence; only the rates matter for integration.
    pub fn from_rates(fpr: Vec<f64>, tpr: Vec<f64>) -> Result<Self, MetricError> {
        if fpr.len() != tpr.len() {
            return Err(MetricError::LengthMismatch {
                labels: tpr.len(),
                predictions: fpr.len(),
            });
        }
        let count = fpr.len();
        let thresholds = (0..count).map(|i| (count - i) as f64).collect();
        Ok(Self {
            fpr,
            tpr,
            thresholds,
            positives: 1,
            negatives: 1,
        })
    }

    /// A curve is degenerate when one class is absent and one of the rates is undefined.
    pub fn is_degenerate(&self) -> bool {
        self.positives == 0 || self.negatives == 0
    }

    pub fn len(&self) -> usize {
        self.fpr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fpr.is_empty()
    }
}

/// Computes the full ROC curve for binary labels.
///
/// Mirrors `roc_curve(..., drop_intermediate=False)`: scores are sorted in descending
/// order, cumulative true and false positive counts are taken at the last index of every
/// run of equal scores, and a leading `(0, 0)` point is prepended. When a class is absent
/// the corresponding rate is `NaN`, exactly as the reference behaves; callers decide what
/// that means.
pub fn roc_curve(
    positives: ArrayView1<bool>,
    scores: ArrayView1<f64>,
) -> Result<RocCurve, MetricError> {
    if positives.len() != scores.len() {
        return Err(MetricError::LengthMismatch {
            labels: positives.len(),
            predictions: scores.len(),
        });
    }
    if let Some((index, &value)) = scores.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(MetricError::NonFinitePrediction { index, value });
    }

    let n = scores.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tps: Vec<f64> = Vec::with_capacity(n + 1);
    let mut fps: Vec<f64> = Vec::with_capacity(n + 1);
    let mut thresholds: Vec<f64> = Vec::with_capacity(n + 1);
    tps.push(0.0);
    fps.push(0.0);
    thresholds.push(f64::INFINITY);

    let mut true_positives = 0usize;
    for (rank, &row) in order.iter().enumerate() {
        if positives[row] {
            true_positives += 1;
        }
        let is_run_end = rank + 1 == n || scores[order[rank + 1]] != scores[row];
        if is_run_end {
            let false_positives = rank + 1 - true_positives;
            tps.push(true_positives as f64);
            fps.push(false_positives as f64);
            thresholds.push(scores[row]);
        }
    }

    let total_positives = true_positives;
    let total_negatives = n - true_positives;
    let fpr = normalize(&fps, total_negatives);
    let tpr = normalize(&tps, total_positives);

    Ok(RocCurve {
        fpr,
        tpr,
        thresholds,
        positives: total_positives,
        negatives: total_negatives,
    })
}

fn normalize(counts: &[f64], total: usize) -> Vec<f64> {
    if total == 0 {
        return vec![f64::NAN; counts.len()];
    }
    let total = total as f64;
    counts.iter().map(|&c| c / total).collect()
}

/// Trapezoidal integral of `y` over `x`. Fewer than two points integrate to zero.
pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[1] + ys[0]) / 2.0)
        .sum()
}
