//! Gradient-boosted regression trees on the logistic loss.
//!
//! Trees are grown depth-first with the exact greedy split search: at every node each
//! sampled feature is sorted and every boundary between distinct values is scored by
//! the second-order gain
//!
//! `0.5 * (GL² / (HL + λ) + GR² / (HR + λ) - G² / (H + λ)) - γ`
//!
//! where `G` and `H` are the sums of loss gradients and hessians of the rows in a node.
//! Leaves predict `-G / (H + λ)` scaled by the learning rate.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

use super::{Classifier, StackingError, check_binary, check_finite, check_rows};
use crate::metric::activations::sigmoid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbdtParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_child_weight: f64,
    pub gamma: f64,
    pub lambda: f64,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub seed: u64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.3,
            max_depth: 6,
            min_child_weight: 1.0,
            gamma: 0.0,
            lambda: 1.0,
            subsample: 1.0,
            colsample_bytree: 1.0,
            seed: 0,
        }
    }
}

impl GbdtParams {
    pub fn validate(&self) -> Result<(), StackingError> {
        let fraction = |name: &str, value: f64| {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(StackingError::InvalidParameter(format!(
                    "{name} must lie in (0, 1], got {value}"
                )))
            }
        };
        fraction("subsample", self.subsample)?;
        fraction("colsample_bytree", self.colsample_bytree)?;
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(StackingError::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        for (name, value) in [
            ("min_child_weight", self.min_child_weight),
            ("gamma", self.gamma),
            ("lambda", self.lambda),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(StackingError::InvalidParameter(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match self.nodes[index] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => index = if row[feature] < threshold { left } else { right },
            }
        }
    }
}

struct Candidate {
    gain: f64,
    feature: usize,
    threshold: f64,
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    gradients: &'a [f64],
    hessians: &'a [f64],
    features: &'a [usize],
    params: &'a GbdtParams,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn structure_score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.lambda)
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        let denominator = h + self.params.lambda;
        if denominator <= 0.0 {
            return 0.0;
        }
        -g / denominator * self.params.learning_rate
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|&r| self.gradients[r]).sum();
        let h: f64 = rows.iter().map(|&r| self.hessians[r]).sum();
        let index = self.nodes.len();
        let value = self.leaf_value(g, h);
        self.nodes.push(Node::Leaf { value });

        if depth >= self.params.max_depth || rows.len() < 2 {
            return index;
        }
        let Some(split) = self.best_split(&rows, g, h) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.x[[r, split.feature]] < split.threshold);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[index] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        index
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<Candidate> {
        let parent = self.structure_score(g, h);
        let mut best: Option<Candidate> = None;
        let mut order = rows.to_vec();

        for &feature in self.features {
            order.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));
            let mut gl = 0.0;
            let mut hl = 0.0;
            for pair in order.windows(2) {
                let (current, next) = (pair[0], pair[1]);
                gl += self.gradients[current];
                hl += self.hessians[current];
                let value = self.x[[current, feature]];
                let next_value = self.x[[next, feature]];
                if value == next_value {
                    continue;
                }
                let hr = h - hl;
                if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                    continue;
                }
                let gain = 0.5
                    * (self.structure_score(gl, hl) + self.structure_score(g - gl, hr) - parent)
                    - self.params.gamma;
                if gain > 0.0 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(Candidate {
                        gain,
                        feature,
                        threshold: value + (next_value - value) / 2.0,
                    });
                }
            }
        }
        best
    }
}

/// Boosted trees for binary classification, in the manner of `binary:logistic`.
///
/// The initial margin is the log-odds of the training positive rate.
#[derive(Clone, Debug, Default)]
pub struct GradientBoosting {
    params: GbdtParams,
    base_margin: f64,
    trees: Vec<Tree>,
    n_features: Option<usize>,
}

impl GradientBoosting {
    pub fn new(params: GbdtParams) -> Self {
        Self {
            params,
            base_margin: 0.0,
            trees: Vec::new(),
            n_features: None,
        }
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn margins(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows()
            .into_iter()
            .map(|row| {
                self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
            })
            .collect()
    }
}

impl Classifier for GradientBoosting {
    fn name(&self) -> &'static str {
        "GradientBoosting"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), StackingError> {
        self.params.validate()?;
        check_rows(x, "labels", y.len())?;
        check_finite(x)?;
        check_binary(y, self.name())?;

        let (n, p) = x.dim();
        let rate = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
        self.base_margin = (rate / (1.0 - rate)).ln();
        self.trees.clear();
        self.n_features = Some(p);

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let row_count = ((self.params.subsample * n as f64).ceil() as usize).clamp(1, n);
        let feature_count = ((self.params.colsample_bytree * p as f64).ceil() as usize).clamp(1, p.max(1));
        let mut margins = Array1::from_elem(n, self.base_margin);

        for round in 0..self.params.n_estimators {
            let prob = margins.mapv(sigmoid);
            let gradients: Vec<f64> = prob.iter().zip(y.iter()).map(|(q, t)| q - t).collect();
            let hessians: Vec<f64> = prob.iter().map(|q| q * (1.0 - q)).collect();

            let mut rows = if row_count < n {
                sample(&mut rng, n, row_count).into_vec()
            } else {
                (0..n).collect()
            };
            rows.sort_unstable();
            let mut features = if feature_count < p {
                sample(&mut rng, p, feature_count).into_vec()
            } else {
                (0..p).collect()
            };
            features.sort_unstable();

            let mut builder = TreeBuilder {
                x: x.view(),
                gradients: &gradients,
                hessians: &hessians,
                features: &features,
                params: &self.params,
                nodes: Vec::new(),
            };
            builder.grow(rows, 0);
            let tree = Tree {
                nodes: builder.nodes,
            };

            for (margin, row) in margins.iter_mut().zip(x.rows()) {
                *margin += tree.predict_row(row);
            }
            log::trace!("Boosting round {round}: {} nodes", tree.nodes.len());
            self.trees.push(tree);
        }
        log::debug!(
            "Gradient boosting fitted {} trees on {n} rows and {p} features",
            self.trees.len()
        );
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, StackingError> {
        let expected = self.n_features.ok_or(StackingError::NotFitted(self.name()))?;
        if x.ncols() != expected {
            return Err(StackingError::ColumnMismatch {
                expected,
                found: x.ncols(),
            });
        }
        Ok(self.margins(x).mapv(sigmoid))
    }
}
