use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

use super::array::parse_array_column;
use super::{
    IMAGE_ID, NUM_CLASSES, PRED_FLAG, PRED_FLAG_TTA, PRED_TYPE, PRED_TYPE_TTA, QUALITY,
    TRUE_FLAG, TRUE_TYPE, TableError,
};

/// One model's predictions for one split, row-aligned by `image_ids`.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictionTable {
    /// Where the table was read from; used in error messages.
    pub source: String,
    pub image_ids: Vec<String>,
    /// Binary ground truth. Present for the holdout split only.
    pub true_flag: Option<Array1<i64>>,
    /// Four-class ground truth. Present for the holdout split only.
    pub true_type: Option<Array1<i64>>,
    /// Raw binary-head logit.
    pub pred_flag: Array1<f64>,
    /// Raw four-class logits, shape `(n, 4)`.
    pub pred_type: Array2<f64>,
    /// One binary-head logit per augmentation.
    pub pred_flag_tta: Option<Array2<f64>>,
    /// Four-class logits of every augmentation, concatenated per row.
    pub pred_type_tta: Option<Array2<f64>>,
}

impl PredictionTable {
    /// Reads and validates a comma-separated prediction table.
    ///
    /// Every column is read as text first so identifiers keep their exact spelling;
    /// numeric columns are converted afterwards.
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let frame = read_text_frame(path)?;
        let table = Self::from_frame(&frame, &path.display().to_string())?;
        log::info!(
            "Loaded {} predictions from '{}'{}",
            table.len(),
            table.source,
            if table.has_labels() { " (labelled)" } else { "" }
        );
        Ok(table)
    }

    pub fn from_frame(frame: &DataFrame, source: &str) -> Result<Self, TableError> {
        for required in [IMAGE_ID, PRED_FLAG, PRED_TYPE] {
            if !has_column(frame, required) {
                return Err(TableError::ColumnNotFound {
                    column: required.to_string(),
                    source_name: source.to_string(),
                });
            }
        }
        if frame.height() == 0 {
            return Err(TableError::Empty(source.to_string()));
        }

        let image_ids = text_column(frame, IMAGE_ID)?;
        let pred_flag = Array1::from_vec(numeric_column(frame, PRED_FLAG)?);
        let pred_type = array_column(frame, PRED_TYPE, Some(NUM_CLASSES))?;

        let true_flag = optional(frame, TRUE_FLAG, label_column)?;
        let true_type = optional(frame, TRUE_TYPE, label_column)?;
        let pred_flag_tta = optional(frame, PRED_FLAG_TTA, |f, c| array_column(f, c, None))?;
        let pred_type_tta = optional(frame, PRED_TYPE_TTA, |f, c| array_column(f, c, None))?;

        Ok(Self {
            source: source.to_string(),
            image_ids,
            true_flag,
            true_type,
            pred_flag,
            pred_type,
            pred_flag_tta,
            pred_type_tta,
        })
    }

    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    pub fn has_labels(&self) -> bool {
        self.true_flag.is_some() || self.true_type.is_some()
    }

    /// `1` for modified images, `0` for covers. Uses the binary column when present and
    /// falls back to `true_type > 0`.
    pub fn binary_labels(&self) -> Option<Array1<i64>> {
        match (&self.true_flag, &self.true_type) {
            (Some(flag), _) => Some(flag.mapv(|v| i64::from(v > 0))),
            (None, Some(kind)) => Some(kind.mapv(|v| i64::from(v > 0))),
            (None, None) => None,
        }
    }
}

/// Reads the JPEG quality of every row from a table with a `quality` column.
///
/// Accepts either the JPEG quality itself (75, 90, 95) or the category index (0, 1, 2)
/// and returns category indices.
pub fn load_quality_factors(path: &Path) -> Result<Array1<usize>, TableError> {
    let frame = read_text_frame(path)?;
    let source = path.display().to_string();
    if !has_column(&frame, QUALITY) {
        return Err(TableError::ColumnNotFound {
            column: QUALITY.to_string(),
            source_name: source,
        });
    }
    let raw = label_column(&frame, QUALITY)?;
    let categories = raw
        .iter()
        .enumerate()
        .map(|(row, &value)| match value {
            0 | 75 => Ok(0),
            1 | 90 => Ok(1),
            2 | 95 => Ok(2),
            other => Err(TableError::InvalidQuality { row, value: other }),
        })
        .collect::<Result<Array1<usize>, TableError>>()?;
    log::debug!("Loaded {} quality factors from '{source}'", categories.len());
    Ok(categories)
}

fn read_text_frame(path: &Path) -> Result<DataFrame, TableError> {
    let frame = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;
    Ok(frame)
}

fn has_column(frame: &DataFrame, name: &str) -> bool {
    frame.get_column_names().iter().any(|c| c.as_str() == name)
}

fn optional<T>(
    frame: &DataFrame,
    name: &str,
    extract: impl Fn(&DataFrame, &str) -> Result<T, TableError>,
) -> Result<Option<T>, TableError> {
    if has_column(frame, name) {
        extract(frame, name).map(Some)
    } else {
        Ok(None)
    }
}

fn text_column(frame: &DataFrame, name: &str) -> Result<Vec<String>, TableError> {
    let column = frame.column(name)?;
    if column.null_count() > 0 {
        return Err(TableError::MissingValues(name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|cell| cell.unwrap_or_default().to_string())
        .collect();
    Ok(values)
}

fn numeric_column(frame: &DataFrame, name: &str) -> Result<Vec<f64>, TableError> {
    let column = frame.column(name)?;
    if column.null_count() > 0 {
        return Err(TableError::MissingValues(name.to_string()));
    }

    let wrong_type = || TableError::ColumnWrongType {
        column: name.to_string(),
        expected: "f64 (numeric)",
        found: format!("{:?}", column.dtype()),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(TableError::NonFinite(name.to_string()));
    }
    Ok(values)
}

fn label_column(frame: &DataFrame, name: &str) -> Result<Array1<i64>, TableError> {
    numeric_column(frame, name)?
        .into_iter()
        .map(|v| {
            if v.fract() == 0.0 {
                Ok(v as i64)
            } else {
                Err(TableError::ColumnWrongType {
                    column: name.to_string(),
                    expected: "integer class labels",
                    found: format!("{v}"),
                })
            }
        })
        .collect()
}

fn array_column(
    frame: &DataFrame,
    name: &str,
    width: Option<usize>,
) -> Result<Array2<f64>, TableError> {
    let cells = text_column(frame, name)?;
    let matrix = parse_array_column(cells.iter().map(String::as_str), width).map_err(|source| {
        TableError::Parse {
            column: name.to_string(),
            source,
        }
    })?;
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(TableError::NonFinite(name.to_string()));
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file.flush().unwrap();
        file
    }

    const HOLDOUT: &str = "\
image_id,true_modification_flag,true_modification_type,pred_modification_flag,pred_modification_type,pred_modification_flag_tta
00001.jpg,0,0,-1.5,\"[2.0, -1.0, -1.0, -1.0]\",\"[-1.4 -1.6]\"
00002.jpg,1,3,0.75,\"[-0.5, 0.1, 0.2, 1.1]\",\"[0.8 0.7]\"
";

    #[test]
    fn loads_labelled_table() {
        let file = write_csv(HOLDOUT);
        let table = PredictionTable::load(file.path()).unwrap();

        assert_eq!(table.image_ids, vec!["00001.jpg", "00002.jpg"]);
        assert_eq!(table.true_flag.as_ref().unwrap().to_vec(), vec![0, 1]);
        assert_eq!(table.true_type.as_ref().unwrap().to_vec(), vec![0, 3]);
        assert_eq!(table.pred_flag.to_vec(), vec![-1.5, 0.75]);
        assert_eq!(table.pred_type.dim(), (2, 4));
        assert_eq!(table.pred_type[[1, 3]], 1.1);
        assert_eq!(table.pred_flag_tta.as_ref().unwrap().dim(), (2, 2));
        assert!(table.pred_type_tta.is_none());
        assert_eq!(table.binary_labels().unwrap().to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_split_has_no_labels() {
        let file = write_csv(
            "image_id,pred_modification_flag,pred_modification_type\n\
             0001.jpg,0.1,\"[1, 2, 3, 4]\"\n",
        );
        let table = PredictionTable::load(file.path()).unwrap();
        assert!(!table.has_labels());
        assert!(table.binary_labels().is_none());
        assert_eq!(table.image_ids, vec!["0001.jpg"]);
    }

    #[test]
    fn missing_column_is_reported() {
        let file = write_csv("image_id,pred_modification_flag\na.jpg,0.1\n");
        let err = PredictionTable::load(file.path()).unwrap_err();
        match err {
            TableError::ColumnNotFound { column, .. } => assert_eq!(column, PRED_TYPE),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn wrong_class_vector_width_is_a_parse_error() {
        let file = write_csv(
            "image_id,pred_modification_flag,pred_modification_type\n\
             a.jpg,0.1,\"[1, 2, 3]\"\n",
        );
        let err = PredictionTable::load(file.path()).unwrap_err();
        assert!(matches!(err, TableError::Parse { .. }));
    }

    #[test]
    fn non_numeric_flag_is_rejected() {
        let file = write_csv(
            "image_id,pred_modification_flag,pred_modification_type\n\
             a.jpg,high,\"[1, 2, 3, 4]\"\n",
        );
        let err = PredictionTable::load(file.path()).unwrap_err();
        assert!(matches!(err, TableError::ColumnWrongType { .. }));
    }

    #[test]
    fn quality_accepts_levels_and_categories() {
        let file = write_csv("image_id,quality\na,75\nb,90\nc,95\nd,1\n");
        let quality = load_quality_factors(file.path()).unwrap();
        assert_eq!(quality.to_vec(), vec![0, 1, 2, 1]);

        let file = write_csv("quality\n80\n");
        let err = load_quality_factors(file.path()).unwrap_err();
        assert!(matches!(err, TableError::InvalidQuality { row: 0, value: 80 }));
    }
}
