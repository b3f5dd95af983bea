use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use super::StackingError;

/// Number of JPEG quality categories (75, 90, 95).
pub const QUALITY_CATEGORIES: usize = 3;

/// Column-wise standardization with population statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    /// Learns column means and standard deviations. Constant columns get a unit scale so
    /// they map to zero instead of NaN.
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, StackingError> {
        if x.nrows() == 0 {
            return Err(StackingError::Shape(
                "cannot fit a scaler on zero rows".to_string(),
            ));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| StackingError::Shape("empty feature matrix".to_string()))?;
        let scale = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, StackingError> {
        if x.ncols() != self.mean.len() {
            return Err(StackingError::ColumnMismatch {
                expected: self.mean.len(),
                found: x.ncols(),
            });
        }
        Ok((&x - &self.mean) / &self.scale)
    }

    pub fn fit_transform(x: ArrayView2<f64>) -> Result<(Self, Array2<f64>), StackingError> {
        let scaler = Self::fit(x)?;
        let transformed = scaler.transform(x)?;
        Ok((scaler, transformed))
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    pub fn scale(&self) -> ArrayView1<f64> {
        self.scale.view()
    }
}

/// One-hot encodes quality categories `0..3` into three columns.
pub fn one_hot_quality(categories: ArrayView1<usize>) -> Result<Array2<f64>, StackingError> {
    let mut encoded = Array2::zeros((categories.len(), QUALITY_CATEGORIES));
    for (row, &value) in categories.iter().enumerate() {
        if value >= QUALITY_CATEGORIES {
            return Err(StackingError::InvalidQuality { row, value });
        }
        encoded[[row, value]] = 1.0;
    }
    Ok(encoded)
}

/// Appends `extra` to the right of `x`.
pub fn append_columns(x: ArrayView2<f64>, extra: ArrayView2<f64>) -> Result<Array2<f64>, StackingError> {
    if x.nrows() != extra.nrows() {
        return Err(StackingError::RowMismatch {
            rows: x.nrows(),
            what: "the appended block",
            found: extra.nrows(),
        });
    }
    concatenate(Axis(1), &[x.view(), extra.view()]).map_err(|e| StackingError::Shape(e.to_string()))
}
