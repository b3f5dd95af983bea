use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use super::MetricError;
use super::roc::{RocCurve, roc_curve, trapezoid};

/// Partition of the true-positive-rate axis into weighted bands.
///
/// `bounds` has one more entry than `weights`; band `i` spans `[bounds[i], bounds[i + 1])`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TprSegments {
    bounds: Vec<f64>,
    weights: Vec<f64>,
}

impl TprSegments {
    pub fn new(bounds: Vec<f64>, weights: Vec<f64>) -> Result<Self, MetricError> {
        if weights.is_empty() || bounds.len() != weights.len() + 1 {
            return Err(MetricError::InvalidSegments(format!(
                "{} bounds cannot delimit {} weighted bands",
                bounds.len(),
                weights.len()
            )));
        }
        if bounds.iter().any(|b| !(0.0..=1.0).contains(b)) {
            return Err(MetricError::InvalidSegments(
                "bounds must lie within [0, 1]".to_string(),
            ));
        }
        if bounds.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(MetricError::InvalidSegments(
                "bounds must be strictly increasing".to_string(),
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MetricError::InvalidSegments(
                "weights must be finite and non-negative".to_string(),
            ));
        }
        let segments = Self { bounds, weights };
        if segments.normalization() <= 0.0 {
            return Err(MetricError::InvalidSegments(
                "at least one band must carry positive weight".to_string(),
            ));
        }
        Ok(segments)
    }

    /// The ALASKA2 leaderboard bands: TPR below 0.4 counts twice.
    pub fn competition() -> Self {
        Self {
            bounds: vec![0.0, 0.4, 1.0],
            weights: vec![2.0, 1.0],
        }
    }

    /// `(lo, hi, weight)` per band.
    pub fn bands(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.bounds
            .windows(2)
            .zip(self.weights.iter())
            .map(|(pair, &w)| (pair[0], pair[1], w))
    }

    /// Area of a perfect classifier: `Σ width × weight`.
    pub fn normalization(&self) -> f64 {
        self.bands().map(|(lo, hi, w)| (hi - lo) * w).sum()
    }
}

impl Default for TprSegments {
    fn default() -> Self {
        Self::competition()
    }
}

/// The segment-weighted area under the ROC curve.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightedAuc {
    segments: TprSegments,
}

impl WeightedAuc {
    pub fn new(segments: TprSegments) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &TprSegments {
        &self.segments
    }

    /// Scores labels against predictions. Any label above zero counts as modified.
    ///
    /// Returns `0.0` when the input holds a single class (or nothing at all): the ROC
    /// curve has no area to measure there, and returning zero keeps fold averages
    /// running. Mismatched lengths and non-finite predictions are errors.
    pub fn score(
        &self,
        y_true: ArrayView1<i64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<f64, MetricError> {
        let positives = binarize(y_true);
        let curve = roc_curve(positives.view(), y_pred)?;
        Ok(self.score_curve(&curve))
    }

    /// Integrates an already computed curve.
    pub fn score_curve(&self, curve: &RocCurve) -> f64 {
        if curve.is_degenerate() || curve.is_empty() {
            log::debug!(
                "Degenerate ROC curve ({} positives, {} negatives); weighted AUC falls back to 0",
                curve.positives,
                curve.negatives
            );
            return 0.0;
        }

        let weighted: f64 = self
            .segment_areas(curve)
            .iter()
            .zip(self.segments.bands())
            .map(|(area, (_, _, w))| area * w)
            .sum();
        let score = weighted / self.segments.normalization();
        if score.is_finite() { score } else { 0.0 }
    }

    /// Unweighted area contributed by every band.
    ///
    /// For band `[lo, hi)`: keep points with `tpr >= lo`, saturate `tpr` at `hi`, shift
    /// down by `lo`, integrate over `fpr`.
    pub fn segment_areas(&self, curve: &RocCurve) -> Vec<f64> {
        self.segments
            .bands()
            .map(|(lo, hi, _)| {
                let (x, y): (Vec<f64>, Vec<f64>) = curve
                    .fpr
                    .iter()
                    .zip(curve.tpr.iter())
                    .filter(|(_, tpr)| **tpr >= lo)
                    .map(|(&fpr, &tpr)| (fpr, tpr.min(hi) - lo))
                    .unzip();
                trapezoid(&x, &y)
            })
            .collect()
    }
}

/// `label > 0` per entry.
pub fn binarize(y_true: ArrayView1<i64>) -> Array1<bool> {
    y_true.mapv(|label| label > 0)
}

/// The ALASKA2 competition metric with the leaderboard's TPR bands.
pub fn alaska_weighted_auc(
    y_true: ArrayView1<i64>,
    y_pred: ArrayView1<f64>,
) -> Result<f64, MetricError> {
    WeightedAuc::default().score(y_true, y_pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn perfect_separation_scores_one() {
        let y_true = array![0, 0, 0, 1, 2, 3];
        let y_pred = array![0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
        let score = alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap();
        assert_abs_diff_eq!(score, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn inverted_separation_scores_zero() {
        let y_true = array![1, 1, 0, 0];
        let y_pred = array![0.1, 0.2, 0.3, 0.4];
        let score = alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap();
        assert_abs_diff_eq!(score, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn single_class_falls_back_to_zero() {
        let y_true = array![0, 0, 0];
        let y_pred = array![0.1, 0.2, 0.3];
        assert_eq!(
            alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap(),
            0.0
        );

        let y_true = array![2, 1, 3];
        assert_eq!(
            alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap(),
            0.0
        );
    }

    #[test]
    fn empty_input_falls_back_to_zero() {
        let y_true: Array1<i64> = Array1::zeros(0);
        let y_pred: Array1<f64> = Array1::zeros(0);
        assert_eq!(
            alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap(),
            0.0
        );
    }

    #[test]
    fn constant_predictions_collapse_to_two_points() {
        // A single threshold leaves only (0,0) and (1,1). Clipping at 0.4 moves the second
        // point to (1, 0.4), so the low band holds a triangle of area 0.2. The high band
        // keeps a single point and integrates to nothing.
        let y_true = array![0, 1, 0, 1];
        let y_pred = array![0.5, 0.5, 0.5, 0.5];
        let score = alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap();
        let expected = 2.0 * 0.2 / 1.4;
        assert_abs_diff_eq!(score, expected, epsilon = 1e-12);
    }

    #[test]
    fn low_band_counts_twice_as_much_as_high_band() {
        let scorer = WeightedAuc::default();

        // Flat at TPR 0.2: area 0.2 entirely inside the low band.
        let low = RocCurve::from_rates(vec![0.0, 1.0], vec![0.2, 0.2]).unwrap();
        let low_areas = scorer.segment_areas(&low);
        assert_abs_diff_eq!(low_areas[0], 0.2, epsilon = 1e-12);
        assert_eq!(low_areas[1], 0.0);

        // Flat at TPR 0.6: the high band sees an area of 0.2 above TPR 0.4.
        let high = RocCurve::from_rates(vec![0.0, 1.0], vec![0.6, 0.6]).unwrap();
        let high_areas = scorer.segment_areas(&high);
        assert_abs_diff_eq!(high_areas[1], 0.2, epsilon = 1e-12);

        let low_contribution = 2.0 * low_areas[0] / 1.4;
        let high_contribution = 1.0 * high_areas[1] / 1.4;
        assert_abs_diff_eq!(low_contribution, 2.0 * high_contribution, epsilon = 1e-12);
        assert_abs_diff_eq!(scorer.score_curve(&low), low_contribution, epsilon = 1e-12);
    }

    #[test]
    fn scores_stay_in_unit_interval_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(7);
        for trial in 0..50 {
            let n = 20 + trial;
            let y_true: Array1<i64> = (0..n).map(|i| (i % 4) as i64).collect();
            let y_pred: Array1<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
            let score = alaska_weighted_auc(y_true.view(), y_pred.view()).unwrap();
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn normalization_of_competition_bands() {
        assert_abs_diff_eq!(TprSegments::competition().normalization(), 1.4, epsilon = 1e-12);
    }

    #[test]
    fn alternate_segments_change_the_score() {
        let y_true = array![0, 1, 0, 1];
        let y_pred = array![0.5, 0.5, 0.5, 0.5];
        let flat = WeightedAuc::new(TprSegments::new(vec![0.0, 1.0], vec![1.0]).unwrap());
        let score = flat.score(y_true.view(), y_pred.view()).unwrap();
        assert_abs_diff_eq!(score, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(TprSegments::new(vec![0.0, 0.4], vec![1.0, 2.0]).is_err());
        assert!(TprSegments::new(vec![0.4, 0.0], vec![1.0]).is_err());
        assert!(TprSegments::new(vec![0.0, 1.5], vec![1.0]).is_err());
        assert!(TprSegments::new(vec![0.0, 1.0], vec![0.0]).is_err());
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let y_true = array![0, 1];
        let y_pred = array![0.5];
        assert!(matches!(
            alaska_weighted_auc(y_true.view(), y_pred.view()),
            Err(MetricError::LengthMismatch { .. })
        ));
    }
}
