use ndarray::ArrayView1;
use std::collections::BTreeMap;

use super::StackingError;

/// Row indices of one cross-validation split, both sorted ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

impl Fold {
    fn from_assignment(assignment: &[usize], fold: usize) -> Self {
        let (valid, train): (Vec<usize>, Vec<usize>) =
            (0..assignment.len()).partition(|&row| assignment[row] == fold);
        Self { train, valid }
    }
}

/// K-fold splitter that never separates rows of the same group.
///
/// Groups are visited from largest to smallest (ties in key order) and each goes to the
/// fold holding the fewest rows so far, which keeps fold sizes close. The assignment is
/// deterministic; there is no shuffling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupKFold {
    n_splits: usize,
}

impl GroupKFold {
    pub fn new(n_splits: usize) -> Result<Self, StackingError> {
        if n_splits < 2 {
            return Err(StackingError::InvalidFoldCount(n_splits));
        }
        Ok(Self { n_splits })
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, groups: &[String]) -> Result<Vec<Fold>, StackingError> {
        let mut sizes: BTreeMap<&str, usize> = BTreeMap::new();
        for group in groups {
            *sizes.entry(group.as_str()).or_default() += 1;
        }
        if sizes.len() < self.n_splits {
            return Err(StackingError::TooFewGroups {
                groups: sizes.len(),
                folds: self.n_splits,
            });
        }

        let mut ordered: Vec<(&str, usize)> = sizes.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));

        let mut fold_sizes = vec![0usize; self.n_splits];
        let mut fold_of_group: BTreeMap<&str, usize> = BTreeMap::new();
        for (group, size) in ordered {
            let lightest = fold_sizes
                .iter()
                .enumerate()
                .min_by_key(|&(fold, &rows)| (rows, fold))
                .map(|(fold, _)| fold)
                .unwrap_or(0);
            fold_sizes[lightest] += size;
            fold_of_group.insert(group, lightest);
        }
        log::debug!("Group k-fold sizes: {fold_sizes:?}");

        let assignment: Vec<usize> = groups
            .iter()
            .map(|g| fold_of_group.get(g.as_str()).copied().unwrap_or(0))
            .collect();
        Ok((0..self.n_splits)
            .map(|fold| Fold::from_assignment(&assignment, fold))
            .collect())
    }
}

/// K-fold splitter that keeps the class balance of every fold close to the whole.
///
/// Rows are split by class (`label > 0.5` is positive) and each class is dealt in row
/// order into the folds, continuing where the previous class stopped. No shuffling, so
/// class-sorted input still gives every fold both classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StratifiedKFold {
    n_splits: usize,
}

impl StratifiedKFold {
    pub fn new(n_splits: usize) -> Result<Self, StackingError> {
        if n_splits < 2 {
            return Err(StackingError::InvalidFoldCount(n_splits));
        }
        Ok(Self { n_splits })
    }

    pub fn split(&self, labels: ArrayView1<f64>) -> Result<Vec<Fold>, StackingError> {
        let n_samples = labels.len();
        if n_samples < self.n_splits {
            return Err(StackingError::TooFewGroups {
                groups: n_samples,
                folds: self.n_splits,
            });
        }

        let (positive, negative): (Vec<usize>, Vec<usize>) =
            (0..n_samples).partition(|&row| labels[row] > 0.5);
        let mut assignment = vec![0usize; n_samples];
        for (dealt, row) in negative.into_iter().chain(positive).enumerate() {
            assignment[row] = dealt % self.n_splits;
        }
        Ok((0..self.n_splits)
            .map(|fold| Fold::from_assignment(&assignment, fold))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn groups(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rows_of_one_image_share_a_fold() {
        // "a" appears four times (cover plus three methods); the rest once or twice.
        let ids = groups(&["a", "b", "a", "c", "d", "a", "e", "b", "f", "a", "g"]);
        let folds = GroupKFold::new(3).unwrap().split(&ids).unwrap();
        assert_eq!(folds.len(), 3);

        let holding_a: Vec<&Fold> = folds
            .iter()
            .filter(|f| f.valid.iter().any(|&row| ids[row] == "a"))
            .collect();
        assert_eq!(holding_a.len(), 1);
        assert_eq!(holding_a[0].valid.iter().filter(|&&row| ids[row] == "a").count(), 4);
        assert!(holding_a[0].train.iter().all(|&row| ids[row] != "a"));
    }

    #[test]
    fn validation_sets_partition_the_rows() {
        let ids: Vec<String> = (0..40).map(|i| format!("img{}", i / 4)).collect();
        let folds = GroupKFold::new(5).unwrap().split(&ids).unwrap();

        let mut seen = HashSet::new();
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.valid.len(), ids.len());
            assert_eq!(fold.valid.len(), 8);
            for &row in &fold.valid {
                assert!(seen.insert(row), "row {row} validated twice");
            }
            let train: HashSet<&String> = fold.train.iter().map(|&r| &ids[r]).collect();
            assert!(fold.valid.iter().all(|&r| !train.contains(&ids[r])));
        }
        assert_eq!(seen.len(), ids.len());
    }

    #[test]
    fn largest_groups_are_spread_first() {
        let ids = groups(&["x", "x", "x", "y", "y", "y", "z", "w"]);
        let folds = GroupKFold::new(2).unwrap().split(&ids).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.valid.len()).collect();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[test]
    fn too_few_groups_is_an_error() {
        let ids = groups(&["a", "a", "b"]);
        assert!(matches!(
            GroupKFold::new(3).unwrap().split(&ids),
            Err(StackingError::TooFewGroups { groups: 2, folds: 3 })
        ));
        assert!(matches!(GroupKFold::new(1), Err(StackingError::InvalidFoldCount(1))));
    }

    #[test]
    fn class_sorted_labels_are_dealt_across_folds() {
        let labels = ndarray::Array1::from_shape_fn(100, |row| f64::from(u8::from(row >= 25)));
        let folds = StratifiedKFold::new(4).unwrap().split(labels.view()).unwrap();
        assert_eq!(folds.len(), 4);

        let mut seen = HashSet::new();
        for fold in &folds {
            let negatives = fold.valid.iter().filter(|&&r| labels[r] < 0.5).count();
            let positives = fold.valid.len() - negatives;
            assert!((6..=7).contains(&negatives), "{negatives} negatives");
            assert!((18..=19).contains(&positives), "{positives} positives");
            assert!(fold.train.iter().any(|&r| labels[r] < 0.5));
            assert!(fold.train.iter().any(|&r| labels[r] > 0.5));
            assert_eq!(fold.train.len() + fold.valid.len(), 100);
            seen.extend(fold.valid.iter().copied());
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn stratified_split_needs_a_row_per_fold() {
        let labels = ndarray::array![0.0, 1.0];
        assert!(matches!(
            StratifiedKFold::new(3).unwrap().split(labels.view()),
            Err(StackingError::TooFewGroups { groups: 2, folds: 3 })
        ));
        assert!(matches!(StratifiedKFold::new(0), Err(StackingError::InvalidFoldCount(0))));
    }
}
