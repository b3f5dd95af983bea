//! # Competition Metric
//!
//! Everything that decides what a "good" steganalysis score is lives here:
//! the segment-weighted ROC AUC used by the ALASKA2 leaderboard, the bootstrap
//! estimator that simulates the leaderboard's sampling noise, the logit-to-probability
//! activations shared with the prediction tables, and a framework-independent metric
//! callback for training loops.

use thiserror::Error;

pub mod activations;
pub mod callback;
pub mod roc;
pub mod shaky;
pub mod wauc;

pub use callback::{AllGather, CompetitionMetricCallback, MetricReport, SingleProcess};
pub use roc::{RocCurve, roc_curve, trapezoid};
pub use shaky::{
    BootstrapConfig, BootstrapEstimator, BootstrapSummary, EXPECTED_TEST_DISTRIBUTION,
    ExpectedDistribution, PUBLIC_LEADERBOARD_SIZE, ShakyOutput, shaky_wauc, shaky_wauc_public,
};
pub use wauc::{TprSegments, WeightedAuc, alaska_weighted_auc, binarize};

/// Failures raised by the metric layer.
///
/// A degenerate single-class input is not an error: the scorer returns `0.0` for it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Labels have {labels} entries but predictions have {predictions}.")]
    LengthMismatch { labels: usize, predictions: usize },

    #[error("Labels have {labels} entries but quality factors have {quality}.")]
    QualityLengthMismatch { labels: usize, quality: usize },

    #[error("Prediction at index {index} is not finite ({value}).")]
    NonFinitePrediction { index: usize, value: f64 },

    #[error(
        "The bootstrap estimator requires more than two distinct labels (multi-class input), found {found}."
    )]
    TooFewClasses { found: usize },

    #[error(
        "Class {class} has {available} examples, but {required} are needed for sampling without replacement."
    )]
    InsufficientClassSamples {
        class: usize,
        available: usize,
        required: usize,
    },

    #[error("Cannot draw {requested} rows without replacement from a bootstrap sample of {available}.")]
    SubsampleTooLarge { requested: usize, available: usize },

    #[error("The bootstrap estimator needs at least one trial.")]
    NoTrials,

    #[error("Invalid class distribution: {0}")]
    InvalidDistribution(String),

    #[error("Invalid TPR segments: {0}")]
    InvalidSegments(String),
}
