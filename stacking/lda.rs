use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

use super::{Classifier, StackingError, check_binary, check_finite, check_rows};
use crate::metric::activations::sigmoid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdaParams {
    /// Ridge added to the pooled covariance, relative to its mean variance.
    pub shrinkage: f64,
}

impl Default for LdaParams {
    fn default() -> Self {
        Self { shrinkage: 1e-4 }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Fitted {
    weights: Array1<f64>,
    intercept: f64,
}

/// Two-class linear discriminant analysis with a shared covariance.
///
/// The pooled covariance is the prior-weighted average of the per-class (biased)
/// covariances; the posterior log-odds are linear in `x`.
#[derive(Clone, Debug, Default)]
pub struct LinearDiscriminant {
    params: LdaParams,
    fitted: Option<Fitted>,
}

impl LinearDiscriminant {
    pub fn new(params: LdaParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }
}

fn class_statistics(x: ArrayView2<f64>, rows: &[usize]) -> (Array1<f64>, Array2<f64>) {
    let subset = x.select(Axis(0), rows);
    let mean = subset
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    let centered = &subset - &mean;
    let covariance = centered.t().dot(&centered) / rows.len() as f64;
    (mean, covariance)
}

impl Classifier for LinearDiscriminant {
    fn name(&self) -> &'static str {
        "LinearDiscriminantAnalysis"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), StackingError> {
        if !(self.params.shrinkage.is_finite() && self.params.shrinkage >= 0.0) {
            return Err(StackingError::InvalidParameter(format!(
                "shrinkage must be non-negative, got {}",
                self.params.shrinkage
            )));
        }
        check_rows(x, "labels", y.len())?;
        check_finite(x)?;
        check_binary(y, self.name())?;

        let (positive, negative): (Vec<usize>, Vec<usize>) =
            (0..y.len()).partition(|&row| y[row] > 0.5);
        let n = y.len() as f64;
        let prior_pos = positive.len() as f64 / n;
        let prior_neg = negative.len() as f64 / n;

        let (mean_pos, cov_pos) = class_statistics(x, &positive);
        let (mean_neg, cov_neg) = class_statistics(x, &negative);
        let mut pooled = cov_pos * prior_pos + cov_neg * prior_neg;

        let p = x.ncols();
        let mean_variance = if p == 0 { 0.0 } else { pooled.diag().sum() / p as f64 };
        let ridge = self.params.shrinkage * mean_variance.max(f64::EPSILON) + f64::EPSILON;
        for j in 0..p {
            pooled[[j, j]] += ridge;
        }

        let weights = pooled.solve_into(&mean_pos - &mean_neg)?;
        let intercept = -0.5 * (weights.dot(&mean_pos) + weights.dot(&mean_neg))
            + (prior_pos / prior_neg).ln();
        log::debug!("LDA fitted on {p} features with ridge {ridge:.3e}");

        self.fitted = Some(Fitted { weights, intercept });
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, StackingError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(StackingError::NotFitted(self.name()))?;
        if x.ncols() != fitted.weights.len() {
            return Err(StackingError::ColumnMismatch {
                expected: fitted.weights.len(),
                found: x.ncols(),
            });
        }
        Ok((x.dot(&fitted.weights) + fitted.intercept).mapv(sigmoid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn one_dimensional_discriminant_matches_closed_form() {
        // Class means -2 and 2, within-class variance 1, equal priors:
        // log-odds are 4x.
        let x = array![[-1.0], [-3.0], [1.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let mut model = LinearDiscriminant::default();
        model.fit(x.view(), y.view()).unwrap();

        let p = model.predict_proba(array![[0.0], [0.5]].view()).unwrap();
        assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(p[1], sigmoid(2.0), epsilon = 1e-3);
    }

    #[test]
    fn priors_shift_the_boundary() {
        let x = array![[-1.0], [-3.0], [-2.0], [-2.0], [1.0], [3.0]];
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let mut model = LinearDiscriminant::default();
        model.fit(x.view(), y.view()).unwrap();
        let p = model.predict_proba(array![[0.0]].view()).unwrap();
        assert!(p[0] < 0.5);
    }

    #[test]
    fn constant_columns_do_not_break_the_solve() {
        let x = array![[1.0, 0.0, -1.0], [1.0, 0.0, -2.0], [1.0, 0.0, 2.0], [1.0, 0.0, 1.5]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let mut model = LinearDiscriminant::default();
        model.fit(x.view(), y.view()).unwrap();
        let p = model.predict_proba(x.view()).unwrap();
        assert!(p.iter().all(|v| v.is_finite()));
        assert!(p[2] > p[0]);
    }
}
