use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::folds::{Fold, GroupKFold, StratifiedKFold};
use super::gbdt::{GbdtParams, GradientBoosting};
use super::lda::{LdaParams, LinearDiscriminant};
use super::logistic::{LogisticParams, LogisticRegression};
use super::{Classifier, StackingError, check_rows};
use crate::metric::alaska_weighted_auc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingParams {
    /// Inner folds used to produce out-of-fold first-level probabilities.
    pub cv: usize,
    pub gradient_boosting: GbdtParams,
    pub logistic: LogisticParams,
    pub lda: LdaParams,
    /// Second-level classifier over the first-level probabilities.
    pub meta: LogisticParams,
}

impl Default for StackingParams {
    fn default() -> Self {
        Self {
            cv: 4,
            gradient_boosting: GbdtParams::default(),
            logistic: LogisticParams::default(),
            lda: LdaParams::default(),
            meta: LogisticParams::default(),
        }
    }
}

/// Two-level stacked generalization.
///
/// First-level classifiers are fitted on inner folds to produce out-of-fold
/// probabilities; the meta-classifier learns from those, and the first level is then
/// refitted on every row for prediction.
pub struct StackingClassifier {
    params: StackingParams,
    bases: Vec<Box<dyn Classifier>>,
    meta: LogisticRegression,
    fitted: bool,
}

impl StackingClassifier {
    pub fn new(params: StackingParams) -> Self {
        let meta = LogisticRegression::new(params.meta.clone());
        Self {
            bases: Vec::new(),
            meta,
            fitted: false,
            params,
        }
    }

    pub fn params(&self) -> &StackingParams {
        &self.params
    }

    fn first_level(&self) -> Vec<Box<dyn Classifier>> {
        vec![
            Box::new(GradientBoosting::new(self.params.gradient_boosting.clone())),
            Box::new(LogisticRegression::new(self.params.logistic.clone())),
            Box::new(LinearDiscriminant::new(self.params.lda.clone())),
        ]
    }

    fn fit_with_folds(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        folds: &[Fold],
    ) -> Result<(), StackingError> {
        let level_count = self.first_level().len();
        let mut out_of_fold = Array2::<f64>::zeros((x.nrows(), level_count));

        for fold in folds {
            let x_train = x.select(Axis(0), &fold.train);
            let y_train = y.select(Axis(0), &fold.train);
            let x_valid = x.select(Axis(0), &fold.valid);
            for (column, mut base) in self.first_level().into_iter().enumerate() {
                base.fit(x_train.view(), y_train.view())?;
                let predicted = base.predict_proba(x_valid.view())?;
                for (&row, &p) in fold.valid.iter().zip(predicted.iter()) {
                    out_of_fold[[row, column]] = p;
                }
            }
        }

        let labels = y.mapv(|v| i64::from(v > 0.5));
        for (column, base) in self.first_level().iter().enumerate() {
            let score = alaska_weighted_auc(labels.view(), out_of_fold.column(column))?;
            log::info!("{} out-of-fold wAUC: {score:.4}", base.name());
        }

        self.meta.fit(out_of_fold.view(), y)?;

        let mut bases = self.first_level();
        for base in bases.iter_mut() {
            base.fit(x, y)?;
        }
        self.bases = bases;
        self.fitted = true;
        Ok(())
    }

    fn first_level_probabilities(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, StackingError> {
        if !self.fitted {
            return Err(StackingError::NotFitted(self.name()));
        }
        let mut probabilities = Array2::<f64>::zeros((x.nrows(), self.bases.len()));
        for (column, base) in self.bases.iter().enumerate() {
            probabilities
                .column_mut(column)
                .assign(&base.predict_proba(x)?);
        }
        Ok(probabilities)
    }
}

impl Default for StackingClassifier {
    fn default() -> Self {
        Self::new(StackingParams::default())
    }
}

impl Classifier for StackingClassifier {
    fn name(&self) -> &'static str {
        "Stack"
    }

    /// Without groups the inner folds are stratified by class.
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), StackingError> {
        check_rows(x, "labels", y.len())?;
        let folds = StratifiedKFold::new(self.params.cv)?.split(y)?;
        self.fit_with_folds(x, y, &folds)
    }

    fn fit_grouped(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        groups: &[String],
    ) -> Result<(), StackingError> {
        check_rows(x, "labels", y.len())?;
        check_rows(x, "groups", groups.len())?;
        let folds = GroupKFold::new(self.params.cv)?.split(groups)?;
        self.fit_with_folds(x, y, &folds)
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, StackingError> {
        let probabilities = self.first_level_probabilities(x)?;
        self.meta.predict_proba(probabilities.view())
    }

    fn component_predictions(
        &self,
        x: ArrayView2<f64>,
    ) -> Option<Result<Vec<(&'static str, Array1<f64>)>, StackingError>> {
        let components = self.first_level_probabilities(x).and_then(|probabilities| {
            let mut components: Vec<(&'static str, Array1<f64>)> = self
                .bases
                .iter()
                .zip(probabilities.columns())
                .map(|(base, column)| (base.name(), column.to_owned()))
                .collect();
            components.push((self.name(), self.meta.predict_proba(probabilities.view())?));
            Ok(components)
        });
        Some(components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy_blobs(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>, Vec<String>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array2::zeros((n, 3));
        let mut y = Array1::zeros(n);
        let mut groups = Vec::with_capacity(n);
        for row in 0..n {
            let label = (row % 2) as f64;
            y[row] = label;
            x[[row, 0]] = label * 1.5 + rng.gen_range(-1.0..1.0);
            x[[row, 1]] = -label + rng.gen_range(-1.0..1.0);
            x[[row, 2]] = rng.gen_range(-1.0..1.0);
            groups.push(format!("img{}", row / 2));
        }
        (x, y, groups)
    }

    fn small_params() -> StackingParams {
        StackingParams {
            gradient_boosting: GbdtParams {
                n_estimators: 10,
                max_depth: 2,
                ..GbdtParams::default()
            },
            ..StackingParams::default()
        }
    }

    #[test]
    fn grouped_stack_separates_blobs() {
        let (x, y, groups) = noisy_blobs(120, 3);
        let mut stack = StackingClassifier::new(small_params());
        stack.fit_grouped(x.view(), y.view(), &groups).unwrap();

        let p = stack.predict_proba(x.view()).unwrap();
        assert_eq!(p.len(), 120);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
        let labels = y.mapv(|v| v as i64);
        let score = alaska_weighted_auc(labels.view(), p.view()).unwrap();
        assert!(score > 0.7, "score {score}");
    }

    #[test]
    fn components_include_every_level() {
        let (x, y, _) = noisy_blobs(80, 5);
        let mut stack = StackingClassifier::new(small_params());
        stack.fit(x.view(), y.view()).unwrap();

        let components = stack.component_predictions(x.view()).unwrap().unwrap();
        let names: Vec<&str> = components.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["GradientBoosting", "LogisticRegression", "LinearDiscriminantAnalysis", "Stack"]
        );
        assert!(components.iter().all(|(_, p)| p.len() == 80));
    }

    #[test]
    fn class_sorted_rows_still_fit() {
        // 25 negatives followed by 75 positives.
        let (x, y, _) = noisy_blobs(150, 7);
        let negatives = (0..150).filter(|&r| y[r] < 0.5).take(25);
        let positives = (0..150).filter(|&r| y[r] > 0.5);
        let rows: Vec<usize> = negatives.chain(positives).collect();
        let x = x.select(Axis(0), &rows);
        let y = y.select(Axis(0), &rows);

        let mut stack = StackingClassifier::new(StackingParams {
            cv: 4,
            ..small_params()
        });
        stack.fit(x.view(), y.view()).unwrap();
        let p = stack.predict_proba(x.view()).unwrap();
        assert_eq!(p.len(), 100);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn unfitted_stack_refuses_to_predict() {
        let stack = StackingClassifier::default();
        assert!(matches!(
            stack.predict_proba(Array2::zeros((1, 3)).view()),
            Err(StackingError::NotFitted("Stack"))
        ));
    }
}
