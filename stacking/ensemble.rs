//! Cross-validated ensembling of several models' predictions.
//!
//! The holdout split is cut into group folds; for every fold a fresh meta-model is fitted
//! on the remaining rows, scored on the held-out rows, and asked for test predictions.
//! The submission is the unweighted average of the per-fold test predictions.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::folds::{Fold, GroupKFold};
use super::gbdt::{GbdtParams, GradientBoosting};
use super::lda::{LdaParams, LinearDiscriminant};
use super::logistic::{LogisticParams, LogisticRegression};
use super::preprocess::{StandardScaler, append_columns, one_hot_quality};
use super::stack::{StackingClassifier, StackingParams};
use super::{Classifier, StackingError};
use crate::metric::alaska_weighted_auc;
use crate::predictions::{FeatureOptions, StackingInputs};
use crate::shared::progress::{ProgressObserver, ProgressStage};

/// The model fitted inside every fold, with its hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetaModel {
    Logistic(LogisticParams),
    GradientBoosting(GbdtParams),
    Lda(LdaParams),
    Stack(StackingParams),
}

impl Default for MetaModel {
    fn default() -> Self {
        Self::Logistic(LogisticParams::default())
    }
}

impl MetaModel {
    pub fn build(&self) -> Box<dyn Classifier> {
        match self {
            Self::Logistic(params) => Box::new(LogisticRegression::new(params.clone())),
            Self::GradientBoosting(params) => Box::new(GradientBoosting::new(params.clone())),
            Self::Lda(params) => Box::new(LinearDiscriminant::new(params.clone())),
            Self::Stack(params) => Box::new(StackingClassifier::new(params.clone())),
        }
    }

    /// Short name used in submission file names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Logistic(_) => "logreg",
            Self::GradientBoosting(_) => "xgb",
            Self::Lda(_) => "lda",
            Self::Stack(_) => "stacking",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub folds: usize,
    /// Standardize features with holdout statistics before fitting.
    pub standardize: bool,
    /// Append the one-hot JPEG quality when quality tables are supplied.
    pub quality_one_hot: bool,
    pub features: FeatureOptions,
    pub model: MetaModel,
    pub parallel_folds: bool,
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            standardize: true,
            quality_one_hot: true,
            features: FeatureOptions::default(),
            model: MetaModel::default(),
            parallel_folds: true,
            seed: 42,
        }
    }
}

impl EnsembleConfig {
    pub fn load(path: &Path) -> Result<Self, StackingError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), StackingError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Holdout and test matrices after preprocessing, ready for cross-validation.
#[derive(Clone, Debug)]
pub struct PreparedData {
    pub x: Array2<f64>,
    pub y: Array1<i64>,
    pub groups: Vec<String>,
    pub x_test: Array2<f64>,
    pub test_ids: Vec<String>,
}

/// Applies standardization and the quality one-hot to both splits.
///
/// Scaling statistics come from the holdout only. The quality columns are appended after
/// scaling so they stay exact indicators.
pub fn prepare_matrices(
    holdout: &StackingInputs,
    test: &StackingInputs,
    quality_holdout: Option<ArrayView1<usize>>,
    quality_test: Option<ArrayView1<usize>>,
    config: &EnsembleConfig,
) -> Result<PreparedData, StackingError> {
    let y = holdout.y.clone().ok_or(StackingError::MissingLabels)?;
    if holdout.x.ncols() != test.x.ncols() {
        return Err(StackingError::ColumnMismatch {
            expected: holdout.x.ncols(),
            found: test.x.ncols(),
        });
    }

    let (mut x, mut x_test) = if config.standardize {
        let (scaler, x) = StandardScaler::fit_transform(holdout.x.view())?;
        let x_test = scaler.transform(test.x.view())?;
        (x, x_test)
    } else {
        (holdout.x.clone(), test.x.clone())
    };

    if config.quality_one_hot {
        match (quality_holdout, quality_test) {
            (Some(qh), Some(qt)) => {
                x = append_columns(x.view(), one_hot_quality(qh)?.view())?;
                x_test = append_columns(x_test.view(), one_hot_quality(qt)?.view())?;
            }
            (None, None) => log::warn!("No quality factors supplied; skipping the quality one-hot"),
            _ => {
                return Err(StackingError::InvalidParameter(
                    "quality factors must be supplied for both holdout and test, or neither"
                        .to_string(),
                ));
            }
        }
    }

    log::info!(
        "Prepared holdout {}x{} and test {}x{}",
        x.nrows(),
        x.ncols(),
        x_test.nrows(),
        x_test.ncols()
    );
    Ok(PreparedData {
        x,
        y,
        groups: holdout.groups(),
        x_test,
        test_ids: test.image_ids.clone(),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FoldReport {
    pub fold: usize,
    pub train_rows: usize,
    pub valid_rows: usize,
    /// Weighted AUC on the held-out rows. `0.0` when they hold a single class.
    pub score: f64,
    /// Held-out scores of the components of a composite model.
    pub components: Vec<(String, f64)>,
}

#[derive(Clone, Debug)]
pub struct EnsembleOutcome {
    pub folds: Vec<FoldReport>,
    pub mean: f64,
    /// Population standard deviation of the fold scores.
    pub std: f64,
    /// Test probabilities averaged over folds.
    pub test_predictions: Array1<f64>,
}

/// Fold scores of a cross-validation run that skipped the test matrix.
#[derive(Clone, Debug)]
pub struct CvScores {
    pub folds: Vec<FoldReport>,
    pub mean: f64,
    /// Population standard deviation of the fold scores.
    pub std: f64,
}

impl CvScores {
    fn from_reports(folds: Vec<FoldReport>) -> Self {
        let n = folds.len() as f64;
        let mean = folds.iter().map(|f| f.score).sum::<f64>() / n;
        let std = (folds.iter().map(|f| (f.score - mean).powi(2)).sum::<f64>() / n).sqrt();
        Self { folds, mean, std }
    }
}

struct FoldOutput {
    report: FoldReport,
    test_predictions: Option<Array1<f64>>,
}

fn run_fold(
    index: usize,
    fold: &Fold,
    x: ArrayView2<f64>,
    y: ArrayView1<i64>,
    groups: &[String],
    x_test: Option<ArrayView2<f64>>,
    model: &MetaModel,
) -> Result<FoldOutput, StackingError> {
    let x_train = x.select(Axis(0), &fold.train);
    let y_train = y.select(Axis(0), &fold.train).mapv(|v| if v > 0 { 1.0 } else { 0.0 });
    let groups_train: Vec<String> = fold.train.iter().map(|&r| groups[r].clone()).collect();
    let x_valid = x.select(Axis(0), &fold.valid);
    let y_valid = y.select(Axis(0), &fold.valid);

    let mut classifier = model.build();
    classifier.fit_grouped(x_train.view(), y_train.view(), &groups_train)?;

    let valid_predictions = classifier.predict_proba(x_valid.view())?;
    let score = alaska_weighted_auc(y_valid.view(), valid_predictions.view())?;
    log::info!("Fold {index}: wAUC {score:.4} on {} rows", fold.valid.len());

    let mut components = Vec::new();
    if let Some(parts) = classifier.component_predictions(x_valid.view()) {
        for (name, predictions) in parts? {
            let part_score = alaska_weighted_auc(y_valid.view(), predictions.view())?;
            log::info!("Fold {index}: {name} wAUC {part_score:.4}");
            components.push((name.to_string(), part_score));
        }
    }

    Ok(FoldOutput {
        report: FoldReport {
            fold: index,
            train_rows: fold.train.len(),
            valid_rows: fold.valid.len(),
            score,
            components,
        },
        test_predictions: x_test.map(|x_test| classifier.predict_proba(x_test)).transpose()?,
    })
}

/// Group k-fold cross-validation of `model` on the holdout, averaging test predictions
/// with weight `1 / n_splits`.
#[allow(clippy::too_many_arguments)]
pub fn cross_validate(
    x: ArrayView2<f64>,
    y: ArrayView1<i64>,
    groups: &[String],
    x_test: ArrayView2<f64>,
    model: &MetaModel,
    n_splits: usize,
    parallel: bool,
    progress: &dyn ProgressObserver,
) -> Result<EnsembleOutcome, StackingError> {
    if x_test.ncols() != x.ncols() {
        return Err(StackingError::ColumnMismatch {
            expected: x.ncols(),
            found: x_test.ncols(),
        });
    }
    let outputs = run_folds(x, y, groups, Some(x_test), model, n_splits, parallel, progress)?;

    let weight = 1.0 / outputs.len() as f64;
    let mut test_predictions = Array1::<f64>::zeros(x_test.nrows());
    for predictions in outputs.iter().filter_map(|o| o.test_predictions.as_ref()) {
        test_predictions.scaled_add(weight, predictions);
    }

    let scores = CvScores::from_reports(outputs.into_iter().map(|o| o.report).collect());
    log::info!(
        "{} cross-validation: mean wAUC {:.4} (std {:.4})",
        model.label(),
        scores.mean,
        scores.std
    );
    Ok(EnsembleOutcome {
        folds: scores.folds,
        mean: scores.mean,
        std: scores.std,
        test_predictions,
    })
}

/// Same folds and scores as [`cross_validate`], but no fold model predicts a test matrix.
pub fn cross_validate_scores(
    x: ArrayView2<f64>,
    y: ArrayView1<i64>,
    groups: &[String],
    model: &MetaModel,
    n_splits: usize,
    parallel: bool,
    progress: &dyn ProgressObserver,
) -> Result<CvScores, StackingError> {
    let outputs = run_folds(x, y, groups, None, model, n_splits, parallel, progress)?;
    let scores = CvScores::from_reports(outputs.into_iter().map(|o| o.report).collect());
    log::debug!("{} fold scores: mean wAUC {:.4}", model.label(), scores.mean);
    Ok(scores)
}

#[allow(clippy::too_many_arguments)]
fn run_folds(
    x: ArrayView2<f64>,
    y: ArrayView1<i64>,
    groups: &[String],
    x_test: Option<ArrayView2<f64>>,
    model: &MetaModel,
    n_splits: usize,
    parallel: bool,
    progress: &dyn ProgressObserver,
) -> Result<Vec<FoldOutput>, StackingError> {
    if y.len() != x.nrows() {
        return Err(StackingError::RowMismatch {
            rows: x.nrows(),
            what: "labels",
            found: y.len(),
        });
    }
    if groups.len() != x.nrows() {
        return Err(StackingError::RowMismatch {
            rows: x.nrows(),
            what: "groups",
            found: groups.len(),
        });
    }

    let folds = GroupKFold::new(n_splits)?.split(groups)?;
    progress.on_stage_start(ProgressStage::CrossValidation, folds.len());
    let run = |(index, fold): (usize, &Fold)| {
        let output = run_fold(index, fold, x, y, groups, x_test, model);
        progress.on_stage_advance(ProgressStage::CrossValidation, 1);
        output
    };
    let outputs = if parallel {
        folds
            .par_iter()
            .enumerate()
            .map(run)
            .collect::<Result<Vec<FoldOutput>, StackingError>>()
    } else {
        folds
            .iter()
            .enumerate()
            .map(run)
            .collect::<Result<Vec<FoldOutput>, StackingError>>()
    };
    progress.on_stage_finish(ProgressStage::CrossValidation);
    outputs
}
