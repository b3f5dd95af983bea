//! Randomized hyperparameter search for the gradient-boosting meta-model.

use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::ensemble::{MetaModel, PreparedData, cross_validate_scores};
use super::gbdt::{GbdtParams, GradientBoosting};
use super::{Classifier, StackingError};
use crate::shared::progress::{NoopProgress, ProgressObserver, ProgressStage};

/// Candidate values per hyperparameter. Every combination is one point of the grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamGrid {
    pub min_child_weight: Vec<f64>,
    pub gamma: Vec<f64>,
    pub subsample: Vec<f64>,
    pub colsample_bytree: Vec<f64>,
    pub max_depth: Vec<usize>,
    pub n_estimators: Vec<usize>,
    pub learning_rate: Vec<f64>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            min_child_weight: vec![1.0, 5.0, 10.0],
            gamma: vec![1e-3, 1e-2, 1e-2, 0.5, 2.0],
            subsample: vec![0.6, 0.8, 1.0],
            colsample_bytree: vec![0.6, 0.8, 1.0],
            max_depth: vec![2, 3, 4, 5, 6],
            n_estimators: vec![16, 32, 64, 128, 256, 1000],
            learning_rate: vec![0.001, 0.01, 0.05, 0.2, 1.0],
        }
    }
}

impl ParamGrid {
    fn axis_lengths(&self) -> [usize; 7] {
        [
            self.min_child_weight.len(),
            self.gamma.len(),
            self.subsample.len(),
            self.colsample_bytree.len(),
            self.max_depth.len(),
            self.n_estimators.len(),
            self.learning_rate.len(),
        ]
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.axis_lengths().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes a flat grid index into parameters, filling everything the grid does not
    /// vary from `base`. The last axis varies fastest.
    pub fn candidate(&self, index: usize, base: &GbdtParams) -> Option<GbdtParams> {
        if index >= self.len() {
            return None;
        }
        let lengths = self.axis_lengths();
        let mut picks = [0usize; 7];
        let mut rest = index;
        for (pick, &length) in picks.iter_mut().zip(lengths.iter()).rev() {
            *pick = rest % length;
            rest /= length;
        }
        Some(GbdtParams {
            min_child_weight: self.min_child_weight[picks[0]],
            gamma: self.gamma[picks[1]],
            subsample: self.subsample[picks[2]],
            colsample_bytree: self.colsample_bytree[picks[3]],
            max_depth: self.max_depth[picks[4]],
            n_estimators: self.n_estimators[picks[5]],
            learning_rate: self.learning_rate[picks[6]],
            ..base.clone()
        })
    }

    /// Draws up to `n_iter` distinct grid points.
    pub fn sample(&self, n_iter: usize, seed: u64, base: &GbdtParams) -> Vec<GbdtParams> {
        let total = self.len();
        let amount = n_iter.min(total);
        let mut rng = StdRng::seed_from_u64(seed);
        sample(&mut rng, total, amount)
            .into_iter()
            .filter_map(|index| self.candidate(index, base))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CandidateResult {
    pub candidate: usize,
    pub params: GbdtParams,
    pub mean: f64,
    pub std: f64,
    pub fold_scores: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub candidates: Vec<CandidateResult>,
    /// Index into `candidates` of the highest mean score; the earliest wins ties.
    pub best: usize,
    /// Test probabilities of the best candidate refitted on the whole holdout.
    pub test_predictions: Array1<f64>,
}

impl SearchOutcome {
    pub fn best(&self) -> &CandidateResult {
        &self.candidates[self.best]
    }

    pub fn write_best_params(&self, path: &Path) -> Result<(), StackingError> {
        fs::write(path, toml::to_string_pretty(&self.best().params)?)?;
        Ok(())
    }

    /// One row per candidate, in sampling order.
    pub fn write_results(&self, path: &Path) -> Result<(), StackingError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "candidate",
            "mean_wauc",
            "std_wauc",
            "min_child_weight",
            "gamma",
            "subsample",
            "colsample_bytree",
            "max_depth",
            "n_estimators",
            "learning_rate",
        ])?;
        for result in &self.candidates {
            let p = &result.params;
            writer.write_record([
                result.candidate.to_string(),
                format!("{:.6}", result.mean),
                format!("{:.6}", result.std),
                p.min_child_weight.to_string(),
                p.gamma.to_string(),
                p.subsample.to_string(),
                p.colsample_bytree.to_string(),
                p.max_depth.to_string(),
                p.n_estimators.to_string(),
                p.learning_rate.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Scores `n_iter` sampled grid points by mean weighted AUC over group folds, then refits
/// the best one on all holdout rows and predicts the test rows.
pub fn randomized_search(
    data: &PreparedData,
    grid: &ParamGrid,
    n_iter: usize,
    n_splits: usize,
    seed: u64,
    progress: &dyn ProgressObserver,
) -> Result<SearchOutcome, StackingError> {
    if grid.is_empty() || n_iter == 0 {
        return Err(StackingError::InvalidParameter(
            "the search needs a non-empty grid and at least one iteration".to_string(),
        ));
    }
    let base = GbdtParams {
        seed,
        ..GbdtParams::default()
    };
    let candidates = grid.sample(n_iter, seed, &base);
    for params in &candidates {
        params.validate()?;
    }
    log::info!(
        "Searching {} of {} grid points with {n_splits}-fold group CV",
        candidates.len(),
        grid.len()
    );

    progress.on_stage_start(ProgressStage::ParameterSearch, candidates.len());
    let results = candidates
        .par_iter()
        .enumerate()
        .map(|(candidate, params)| {
            let outcome = cross_validate_scores(
                data.x.view(),
                data.y.view(),
                &data.groups,
                &MetaModel::GradientBoosting(params.clone()),
                n_splits,
                false,
                &NoopProgress,
            );
            progress.on_stage_advance(ProgressStage::ParameterSearch, 1);
            outcome.map(|outcome| CandidateResult {
                candidate,
                params: params.clone(),
                mean: outcome.mean,
                std: outcome.std,
                fold_scores: outcome.folds.iter().map(|f| f.score).collect(),
            })
        })
        .collect::<Result<Vec<CandidateResult>, StackingError>>();
    progress.on_stage_finish(ProgressStage::ParameterSearch);
    let results = results?;

    let mut best = 0;
    for (index, result) in results.iter().enumerate() {
        if result.mean > results[best].mean {
            best = index;
        }
    }
    log::info!(
        "Best candidate {} reached mean wAUC {:.4}: {:?}",
        best,
        results[best].mean,
        results[best].params
    );

    let mut model = GradientBoosting::new(results[best].params.clone());
    let labels = data.y.mapv(|v| if v > 0 { 1.0 } else { 0.0 });
    model.fit(data.x.view(), labels.view())?;
    let test_predictions = model.predict_proba(data.x_test.view())?;

    Ok(SearchOutcome {
        candidates: results,
        best,
        test_predictions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn default_grid_size() {
        assert_eq!(ParamGrid::default().len(), 3 * 5 * 3 * 3 * 5 * 6 * 5);
    }

    #[test]
    fn decoding_walks_the_last_axis_first() {
        let grid = ParamGrid::default();
        let base = GbdtParams::default();
        let first = grid.candidate(0, &base).unwrap();
        assert_eq!(first.min_child_weight, 1.0);
        assert_eq!(first.learning_rate, 0.001);
        assert_eq!(grid.candidate(1, &base).unwrap().learning_rate, 0.01);
        let sixth = grid.candidate(5, &base).unwrap();
        assert_eq!(sixth.learning_rate, 0.001);
        assert_eq!(sixth.n_estimators, 32);
        let last = grid.candidate(grid.len() - 1, &base).unwrap();
        assert_eq!(last.min_child_weight, 10.0);
        assert_eq!(last.n_estimators, 1000);
        assert!(grid.candidate(grid.len(), &base).is_none());
    }

    #[test]
    fn samples_are_distinct_and_seeded() {
        let grid = ParamGrid::default();
        let base = GbdtParams::default();
        let a = grid.sample(25, 42, &base);
        let b = grid.sample(25, 42, &base);
        assert_eq!(a, b);
        let keys: HashSet<String> = a.iter().map(|p| format!("{p:?}")).collect();
        assert_eq!(keys.len(), 25);
    }

    fn tiny_grid() -> ParamGrid {
        ParamGrid {
            min_child_weight: vec![1.0],
            gamma: vec![0.0],
            subsample: vec![1.0],
            colsample_bytree: vec![1.0],
            max_depth: vec![1, 2],
            n_estimators: vec![4, 8],
            learning_rate: vec![0.3],
        }
    }

    #[test]
    fn small_grids_are_exhausted() {
        assert_eq!(tiny_grid().sample(25, 1, &GbdtParams::default()).len(), 4);
    }

    fn prepared(seed: u64) -> PreparedData {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = 80;
        let mut x = Array2::zeros((n, 2));
        let mut y = Array1::zeros(n);
        let mut groups = Vec::with_capacity(n);
        for row in 0..n {
            let label = (row % 2) as i64;
            y[row] = label;
            x[[row, 0]] = label as f64 + rng.gen_range(-0.8..0.8);
            x[[row, 1]] = rng.gen_range(-1.0..1.0);
            groups.push(format!("{:05}", row / 2));
        }
        PreparedData {
            x,
            y,
            groups,
            x_test: Array2::from_shape_vec((3, 2), vec![-1.0, 0.0, 0.5, 0.0, 2.0, 0.0]).unwrap(),
            test_ids: vec!["a".into(), "b".into(), "c".into()],
        }
    }

    #[test]
    fn search_picks_the_best_mean_and_persists_it() {
        let data = prepared(9);
        let outcome = randomized_search(&data, &tiny_grid(), 10, 4, 7, &NoopProgress).unwrap();

        assert_eq!(outcome.candidates.len(), 4);
        let top = outcome
            .candidates
            .iter()
            .map(|c| c.mean)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.best().mean, top);
        assert!(outcome.candidates.iter().all(|c| c.fold_scores.len() == 4));
        assert_eq!(outcome.test_predictions.len(), 3);
        assert!(outcome.test_predictions[2] > outcome.test_predictions[0]);

        let dir = tempfile::tempdir().unwrap();
        let params_path = dir.path().join("best.toml");
        outcome.write_best_params(&params_path).unwrap();
        let restored: GbdtParams =
            toml::from_str(&fs::read_to_string(&params_path).unwrap()).unwrap();
        assert_eq!(&restored, &outcome.best().params);

        let results_path = dir.path().join("results.csv");
        outcome.write_results(&results_path).unwrap();
        let text = fs::read_to_string(&results_path).unwrap();
        assert_eq!(text.lines().count(), 5);
        assert!(text.starts_with("candidate,mean_wauc,std_wauc"));
    }

    #[test]
    fn empty_grid_is_rejected() {
        let grid = ParamGrid {
            max_depth: Vec::new(),
            ..tiny_grid()
        };
        assert!(matches!(
            randomized_search(&prepared(1), &grid, 5, 4, 0, &NoopProgress),
            Err(StackingError::InvalidParameter(_))
        ));
    }
}
