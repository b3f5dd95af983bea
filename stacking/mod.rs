//! # Group-Aware Stacking
//!
//! Combines the feature matrices built from several models into one calibrated
//! probability per image. Rows that share an underlying image (a cover and its stego
//! variants) always land in the same fold, so no image is ever scored by a meta-model
//! that saw it during fitting.
//!
//! The meta-models are deliberately small: L2-regularized logistic regression solved by
//! Newton iterations, linear discriminant analysis on a pooled covariance,
//! second-order gradient-boosted trees, and a two-level stack of those three.

use ndarray::{Array1, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

use crate::metric::MetricError;

pub mod ensemble;
pub mod folds;
pub mod gbdt;
pub mod lda;
pub mod logistic;
pub mod preprocess;
pub mod search;
pub mod stack;

pub use ensemble::{
    CvScores, EnsembleConfig, EnsembleOutcome, FoldReport, MetaModel, PreparedData,
    cross_validate, cross_validate_scores, prepare_matrices,
};
pub use folds::{Fold, GroupKFold, StratifiedKFold};
pub use gbdt::{GbdtParams, GradientBoosting};
pub use lda::{LdaParams, LinearDiscriminant};
pub use logistic::{LogisticParams, LogisticRegression};
pub use preprocess::{StandardScaler, append_columns, one_hot_quality};
pub use search::{CandidateResult, ParamGrid, SearchOutcome, randomized_search};
pub use stack::{StackingClassifier, StackingParams};

#[derive(Error, Debug)]
pub enum StackingError {
    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Feature matrix has {rows} rows but {what} has {found}.")]
    RowMismatch {
        rows: usize,
        what: &'static str,
        found: usize,
    },

    #[error("Model was fitted on {expected} columns but received {found}.")]
    ColumnMismatch { expected: usize, found: usize },

    #[error("Cannot split {groups} distinct groups into {folds} folds.")]
    TooFewGroups { groups: usize, folds: usize },

    #[error("At least 2 folds are required, got {0}.")]
    InvalidFoldCount(usize),

    #[error("Training labels contain a single class; {0} cannot be fitted.")]
    SingleClass(&'static str),

    #[error("The holdout predictions carry no true labels.")]
    MissingLabels,

    #[error("{0} must be fitted before predicting.")]
    NotFitted(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Feature column {column} contains a non-finite value.")]
    NonFiniteFeature { column: usize },

    #[error("Row {row} has quality category {value}; expected 0, 1 or 2.")]
    InvalidQuality { row: usize, value: usize },

    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// A binary probabilistic classifier.
///
/// `fit` takes `0/1` labels as floats. Implementations own their fitted state and may be
/// fitted more than once; every fit replaces the previous state.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), StackingError>;

    /// Fit with a grouping of rows. Only classifiers that split their own training data
    /// internally care about groups.
    fn fit_grouped(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        groups: &[String],
    ) -> Result<(), StackingError> {
        let _ = groups;
        self.fit(x, y)
    }

    /// Probability of the positive class for every row.
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, StackingError>;

    /// Per-component probabilities for composite models, keyed by component name.
    fn component_predictions(
        &self,
        x: ArrayView2<f64>,
    ) -> Option<Result<Vec<(&'static str, Array1<f64>)>, StackingError>> {
        let _ = x;
        None
    }
}

pub(crate) fn check_rows(x: ArrayView2<f64>, what: &'static str, found: usize) -> Result<(), StackingError> {
    if x.nrows() != found {
        return Err(StackingError::RowMismatch {
            rows: x.nrows(),
            what,
            found,
        });
    }
    Ok(())
}

pub(crate) fn check_finite(x: ArrayView2<f64>) -> Result<(), StackingError> {
    for (column, values) in x.columns().into_iter().enumerate() {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StackingError::NonFiniteFeature { column });
        }
    }
    Ok(())
}

/// Returns an error unless both classes are present.
pub(crate) fn check_binary(y: ArrayView1<f64>, model: &'static str) -> Result<(), StackingError> {
    let positives = y.iter().filter(|&&v| v > 0.5).count();
    if positives == 0 || positives == y.len() {
        return Err(StackingError::SingleClass(model));
    }
    Ok(())
}
