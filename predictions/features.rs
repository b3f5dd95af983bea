use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{NUM_CLASSES, PredictionTable, TableError};
use crate::metric::activations::{classifier_probability, sigmoid, softmax};

/// Which columns each model contributes to the stacking matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureOptions {
    /// Keep raw logits next to the derived probabilities. When off, the class vector is
    /// replaced by its softmax and the raw flag is dropped.
    pub with_logits: bool,
    pub include_tta: bool,
    /// Keep raw TTA logits. When off, they are reduced to one probability per augmentation.
    pub tta_logits: bool,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            with_logits: true,
            include_tta: true,
            tta_logits: true,
        }
    }
}

/// Row-aligned features from all models of one split.
#[derive(Clone, Debug)]
pub struct StackingInputs {
    pub x: Array2<f64>,
    /// Binary labels, when the split is labelled.
    pub y: Option<Array1<i64>>,
    pub image_ids: Vec<String>,
    pub column_names: Vec<String>,
}

impl StackingInputs {
    /// Fold-grouping key of every row.
    pub fn groups(&self) -> Vec<String> {
        self.image_ids.iter().map(|id| group_key(id)).collect()
    }
}

/// Identity of the underlying image: the file stem of the id, so `00042.jpg` from the
/// cover folder and `00042.jpg` from a stego folder share a group.
pub fn group_key(image_id: &str) -> String {
    Path::new(image_id)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(image_id)
        .to_string()
}

/// Stacks the per-model feature blocks column-wise.
///
/// Tables must list the same image ids in the same order; any mismatch is an
/// alignment error.
pub fn build_features(
    tables: &[PredictionTable],
    options: &FeatureOptions,
) -> Result<StackingInputs, TableError> {
    let reference = tables.first().ok_or(TableError::NoTables)?;
    for other in &tables[1..] {
        check_alignment(reference, other)?;
    }

    let mut blocks: Vec<Array2<f64>> = Vec::new();
    let mut column_names = Vec::new();
    for (model, table) in tables.iter().enumerate() {
        append_model_block(model, table, options, &mut blocks, &mut column_names)?;
    }

    let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
    let x = concatenate(Axis(1), &views).map_err(|e| TableError::Shape(e.to_string()))?;

    let y = tables.iter().find_map(PredictionTable::binary_labels);

    log::info!(
        "Built a {}x{} stacking matrix from {} model(s)",
        x.nrows(),
        x.ncols(),
        tables.len()
    );
    Ok(StackingInputs {
        x,
        y,
        image_ids: reference.image_ids.clone(),
        column_names,
    })
}

fn check_alignment(reference: &PredictionTable, other: &PredictionTable) -> Result<(), TableError> {
    if reference.len() != other.len() {
        return Err(TableError::Shape(format!(
            "'{}' has {} rows but '{}' has {}",
            reference.source,
            reference.len(),
            other.source,
            other.len()
        )));
    }
    let mismatch = reference
        .image_ids
        .iter()
        .zip(other.image_ids.iter())
        .position(|(a, b)| a != b);
    if let Some(row) = mismatch {
        return Err(TableError::Alignment {
            reference: reference.source.clone(),
            other: other.source.clone(),
            row,
            expected: reference.image_ids[row].clone(),
            found: other.image_ids[row].clone(),
        });
    }
    Ok(())
}

fn append_model_block(
    model: usize,
    table: &PredictionTable,
    options: &FeatureOptions,
    blocks: &mut Vec<Array2<f64>>,
    names: &mut Vec<String>,
) -> Result<(), TableError> {
    let flag = table.pred_flag.view().insert_axis(Axis(1)).to_owned();
    let flag_probability = table.pred_flag.mapv(sigmoid).insert_axis(Axis(1));
    let classifier = classifier_column(table.pred_type.view());

    if options.with_logits {
        blocks.push(flag);
        names.push(format!("m{model}_flag"));
        blocks.push(table.pred_type.clone());
        names.extend((0..table.pred_type.ncols()).map(|c| format!("m{model}_type_{c}")));
    }
    blocks.push(flag_probability);
    names.push(format!("m{model}_flag_sigmoid"));
    if !options.with_logits {
        let mut probabilities = table.pred_type.clone();
        for mut row in probabilities.rows_mut() {
            let p = softmax(row.view());
            row.assign(&p);
        }
        names.extend((0..probabilities.ncols()).map(|c| format!("m{model}_type_softmax_{c}")));
        blocks.push(probabilities);
    }
    blocks.push(classifier);
    names.push(format!("m{model}_classifier"));

    if !options.include_tta {
        return Ok(());
    }

    if let Some(type_tta) = &table.pred_type_tta {
        if options.tta_logits {
            names.extend((0..type_tta.ncols()).map(|c| format!("m{model}_type_tta_{c}")));
            blocks.push(type_tta.clone());
        } else {
            if type_tta.ncols() % NUM_CLASSES != 0 {
                return Err(TableError::Shape(format!(
                    "'{}' has {} TTA class scores per row, not a multiple of {NUM_CLASSES}",
                    table.source,
                    type_tta.ncols()
                )));
            }
            let augmentations = type_tta.ncols() / NUM_CLASSES;
            let mut reduced = Array2::zeros((type_tta.nrows(), augmentations));
            for (row, values) in type_tta.rows().into_iter().enumerate() {
                for (aug, chunk) in values.exact_chunks(NUM_CLASSES).into_iter().enumerate() {
                    reduced[[row, aug]] = classifier_probability(chunk);
                }
            }
            names.extend((0..augmentations).map(|a| format!("m{model}_classifier_tta_{a}")));
            blocks.push(reduced);
        }
    }

    if let Some(flag_tta) = &table.pred_flag_tta {
        if options.tta_logits {
            names.extend((0..flag_tta.ncols()).map(|c| format!("m{model}_flag_tta_{c}")));
            blocks.push(flag_tta.clone());
        } else {
            names.extend((0..flag_tta.ncols()).map(|c| format!("m{model}_flag_tta_sigmoid_{c}")));
            blocks.push(flag_tta.mapv(sigmoid));
        }
    }
    Ok(())
}

fn classifier_column(logits: ArrayView2<f64>) -> Array2<f64> {
    logits
        .rows()
        .into_iter()
        .map(classifier_probability)
        .collect::<Array1<f64>>()
        .insert_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn table(source: &str, ids: &[&str], tta: bool) -> PredictionTable {
        let n = ids.len();
        PredictionTable {
            source: source.to_string(),
            image_ids: ids.iter().map(|s| s.to_string()).collect(),
            true_flag: Some(Array1::from_iter((0..n).map(|i| (i % 2) as i64))),
            true_type: Some(Array1::from_iter((0..n).map(|i| (i % 4) as i64))),
            pred_flag: Array1::from_iter((0..n).map(|i| i as f64 - 1.0)),
            pred_type: Array2::from_shape_fn((n, 4), |(i, c)| (i + c) as f64 * 0.1),
            pred_flag_tta: tta.then(|| Array2::from_elem((n, 2), 0.0)),
            pred_type_tta: tta.then(|| Array2::zeros((n, 8))),
        }
    }

    #[test]
    fn logits_layout_per_model() {
        let tables = vec![table("a", &["1.jpg", "2.jpg"], false), table("b", &["1.jpg", "2.jpg"], false)];
        let inputs = build_features(&tables, &FeatureOptions::default()).unwrap();

        // flag, four logits, sigmoid(flag), classifier probability
        assert_eq!(inputs.x.dim(), (2, 14));
        assert_eq!(inputs.column_names.len(), 14);
        assert_eq!(inputs.column_names[0], "m0_flag");
        assert_eq!(inputs.column_names[7], "m1_flag");
        assert_abs_diff_eq!(inputs.x[[0, 5]], sigmoid(-1.0), epsilon = 1e-12);
        assert_eq!(inputs.y.unwrap().to_vec(), vec![0, 1]);
    }

    #[test]
    fn probability_layout_without_logits() {
        let tables = vec![table("a", &["1.jpg", "2.jpg"], false)];
        let options = FeatureOptions {
            with_logits: false,
            ..FeatureOptions::default()
        };
        let inputs = build_features(&tables, &options).unwrap();
        assert_eq!(inputs.x.dim(), (2, 6));
        let softmax_sum: f64 = (1..5).map(|c| inputs.x[[1, c]]).sum();
        assert_abs_diff_eq!(softmax_sum, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn tta_columns_follow_the_options() {
        let tables = vec![table("a", &["1.jpg"], true)];
        let raw = build_features(&tables, &FeatureOptions::default()).unwrap();
        assert_eq!(raw.x.ncols(), 7 + 8 + 2);

        let reduced = build_features(
            &tables,
            &FeatureOptions {
                tta_logits: false,
                ..FeatureOptions::default()
            },
        )
        .unwrap();
        assert_eq!(reduced.x.ncols(), 7 + 2 + 2);
        // All-zero class logits leave three quarters of the mass on the stego classes.
        assert_abs_diff_eq!(reduced.x[[0, 7]], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(reduced.x[[0, 9]], 0.5, epsilon = 1e-12);

        let skipped = build_features(
            &tables,
            &FeatureOptions {
                include_tta: false,
                ..FeatureOptions::default()
            },
        )
        .unwrap();
        assert_eq!(skipped.x.ncols(), 7);
    }

    #[test]
    fn misaligned_tables_are_rejected() {
        let tables = vec![table("a", &["1.jpg", "2.jpg"], false), table("b", &["1.jpg", "3.jpg"], false)];
        let err = build_features(&tables, &FeatureOptions::default()).unwrap_err();
        match err {
            TableError::Alignment { row, expected, found, .. } => {
                assert_eq!(row, 1);
                assert_eq!(expected, "2.jpg");
                assert_eq!(found, "3.jpg");
            }
            other => panic!("expected an alignment error, got {other:?}"),
        }

        let short = vec![table("a", &["1.jpg", "2.jpg"], false), table("b", &["1.jpg"], false)];
        assert!(matches!(
            build_features(&short, &FeatureOptions::default()),
            Err(TableError::Shape(_))
        ));
        assert!(matches!(
            build_features(&[], &FeatureOptions::default()),
            Err(TableError::NoTables)
        ));
    }

    #[test]
    fn group_key_strips_directory_and_extension() {
        assert_eq!(group_key("00042.jpg"), "00042");
        assert_eq!(group_key("JMiPOD/00042.jpg"), "00042");
        assert_eq!(group_key("plain"), "plain");

        let inputs = StackingInputs {
            x: array![[0.0], [1.0]],
            y: None,
            image_ids: vec!["Cover/7.jpg".to_string(), "UERD/7.jpg".to_string()],
            column_names: vec!["c".to_string()],
        };
        assert_eq!(inputs.groups(), vec!["7", "7"]);
    }
}
