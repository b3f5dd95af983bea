use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

use super::{Classifier, StackingError, check_binary, check_finite, check_rows};
use crate::metric::activations::sigmoid;

const MAX_STEP_HALVINGS: usize = 30;
const MIN_CURVATURE: f64 = 1e-12;

/// L2-regularized logistic regression settings. The penalty on the weights is
/// `||w||² / (2C)`; the intercept is not penalized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 10_000,
            tol: 1e-5,
        }
    }
}

impl LogisticParams {
    pub fn validate(&self) -> Result<(), StackingError> {
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(StackingError::InvalidParameter(format!(
                "C must be positive, got {}",
                self.c
            )));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(StackingError::InvalidParameter(format!(
                "tol must be positive, got {}",
                self.tol
            )));
        }
        if self.max_iter == 0 {
            return Err(StackingError::InvalidParameter(
                "max_iter must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Fitted {
    weights: Array1<f64>,
    intercept: f64,
}

/// Binary logistic regression fitted by damped Newton iterations.
#[derive(Clone, Debug, Default)]
pub struct LogisticRegression {
    params: LogisticParams,
    fitted: Option<Fitted>,
}

impl LogisticRegression {
    pub fn new(params: LogisticParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn params(&self) -> &LogisticParams {
        &self.params
    }

    pub fn coefficients(&self) -> Option<(ArrayView1<f64>, f64)> {
        self.fitted
            .as_ref()
            .map(|f| (f.weights.view(), f.intercept))
    }
}

/// `x` with a trailing column of ones.
fn with_intercept(x: ArrayView2<f64>) -> Result<Array2<f64>, StackingError> {
    let ones = Array2::ones((x.nrows(), 1));
    concatenate(Axis(1), &[x.view(), ones.view()]).map_err(|e| StackingError::Shape(e.to_string()))
}

/// `log(1 + exp(eta))` without overflow.
fn softplus(eta: f64) -> f64 {
    if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    }
}

fn objective(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    beta: &Array1<f64>,
    penalty: &Array1<f64>,
) -> f64 {
    let eta = design.dot(beta);
    let loss: f64 = eta
        .iter()
        .zip(y.iter())
        .map(|(&e, &t)| softplus(e) - t * e)
        .sum();
    loss + 0.5 * (penalty * beta * beta).sum()
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &'static str {
        "LogisticRegression"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), StackingError> {
        self.params.validate()?;
        check_rows(x, "labels", y.len())?;
        check_finite(x)?;
        check_binary(y, self.name())?;

        let p = x.ncols();
        let design = with_intercept(x)?;
        let penalty = Array1::from_shape_fn(p + 1, |j| if j < p { 1.0 / self.params.c } else { 0.0 });

        let mut beta = Array1::<f64>::zeros(p + 1);
        let rate = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
        beta[p] = (rate / (1.0 - rate)).ln();
        let mut current = objective(&design, y, &beta, &penalty);

        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.params.max_iter {
            iterations += 1;
            let prob = design.dot(&beta).mapv(sigmoid);
            let residual = &prob - &y;
            let gradient = design.t().dot(&residual) + &penalty * &beta;
            let largest = gradient.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
            if largest < self.params.tol {
                converged = true;
                break;
            }

            let curvature = prob.mapv(|q| (q * (1.0 - q)).max(MIN_CURVATURE));
            let weighted = &design * &curvature.view().insert_axis(Axis(1));
            let mut hessian = design.t().dot(&weighted);
            for j in 0..=p {
                hessian[[j, j]] += penalty[j];
            }
            let step = hessian.solve_into(gradient)?;

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &beta - &(&step * scale);
                let value = objective(&design, y, &candidate, &penalty);
                if value <= current {
                    accepted = Some((candidate, value));
                    break;
                }
                scale *= 0.5;
            }
            let Some((candidate, value)) = accepted else {
                log::debug!("Logistic regression line search stalled after {iterations} iterations");
                converged = true;
                break;
            };
            let improvement = current - value;
            beta = candidate;
            current = value;
            if improvement <= f64::EPSILON * current.abs().max(1.0) {
                converged = true;
                break;
            }
        }
        if !converged {
            log::warn!(
                "Logistic regression did not converge within {} iterations",
                self.params.max_iter
            );
        }
        log::debug!("Logistic regression fitted in {iterations} iterations, objective {current:.6}");

        self.fitted = Some(Fitted {
            weights: beta.slice(s![..p]).to_owned(),
            intercept: beta[p],
        });
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
