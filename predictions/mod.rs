//! # Prediction Tables
//!
//! Per-model prediction files are the boundary between the networks and the ensemble.
//! Each file is a comma-separated table keyed by `image_id` with the binary-head score,
//! the four-class logit vector written as an array literal, optional TTA variants of
//! both, and (for the holdout split) the true labels. This module reads those tables,
//! validates them, aligns them across models, and turns them into the feature matrices
//! consumed by [`crate::stacking`]. Submissions go back out through [`submission`].

use polars::prelude::PolarsError;
use thiserror::Error;

pub mod array;
pub mod features;
pub mod submission;
pub mod table;

pub use array::{ArrayParseError, parse_array, parse_array_column};
pub use features::{FeatureOptions, StackingInputs, build_features, group_key};
pub use submission::{SubmissionError, default_submission_name, write_submission};
pub use table::{PredictionTable, load_quality_factors};

pub const IMAGE_ID: &str = "image_id";
pub const TRUE_FLAG: &str = "true_modification_flag";
pub const TRUE_TYPE: &str = "true_modification_type";
pub const PRED_FLAG: &str = "pred_modification_flag";
pub const PRED_TYPE: &str = "pred_modification_type";
pub const PRED_FLAG_TTA: &str = "pred_modification_flag_tta";
pub const PRED_TYPE_TTA: &str = "pred_modification_type_tta";
pub const QUALITY: &str = "quality";

/// Number of classes in the per-class score vector: cover plus three embedding methods.
pub const NUM_CLASSES: usize = 4;

/// Failures while reading or combining prediction tables.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The required column '{column}' was not found in '{source_name}'.")]
    ColumnNotFound { column: String, source_name: String },

    #[error(
        "The column '{column}' could not be converted to {expected}. (Found type: {found})"
    )]
    ColumnWrongType {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),

    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFinite(String),

    #[error("Column '{column}' holds an invalid array literal: {source}")]
    Parse {
        column: String,
        #[source]
        source: ArrayParseError,
    },

    #[error("The table '{0}' contains no rows.")]
    Empty(String),

    #[error(
        "Tables are not row-aligned: row {row} of '{other}' has image id '{found}', expected '{expected}' from '{reference}'."
    )]
    Alignment {
        reference: String,
        other: String,
        row: usize,
        expected: String,
        found: String,
    },

    #[error("At least one prediction table is required.")]
    NoTables,

    #[error("Row {row} has quality value {value}; expected 75, 90, 95 or a category 0, 1, 2.")]
    InvalidQuality { row: usize, value: i64 },

    #[error("Shape error: {0}")]
    Shape(String),
}
