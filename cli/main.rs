#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::Array1;
use rayon::prelude::*;
use std::path::PathBuf;
use std::process;

use alaska2::metric::activations::classifier_logits_to_probas;
use alaska2::metric::{
    BootstrapConfig, BootstrapEstimator, BootstrapSummary, WeightedAuc, roc_curve,
};
use alaska2::predictions::{
    PredictionTable, StackingInputs, TableError, build_features, default_submission_name,
    load_quality_factors, write_submission,
};
use alaska2::shared::progress::TerminalProgress;
use alaska2::stacking::{
    EnsembleConfig, GbdtParams, LdaParams, LogisticParams, MetaModel, ParamGrid, PreparedData,
    StackingParams, cross_validate, prepare_matrices, randomized_search,
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Clone, Copy, ValueEnum)]
enum ScoredColumn {
    /// The binary logit, `pred_modification_flag`
    Flag,
    /// Probability of any modification from the four-class logits
    Type,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetaModelCli {
    Logreg,
    Xgb,
    Lda,
    Stacking,
}

impl MetaModelCli {
    fn into_model(self) -> MetaModel {
        match self {
            Self::Logreg => MetaModel::Logistic(LogisticParams::default()),
            Self::Xgb => MetaModel::GradientBoosting(GbdtParams::default()),
            Self::Lda => MetaModel::Lda(LdaParams::default()),
            Self::Stacking => MetaModel::Stack(StackingParams::default()),
        }
    }
}

#[derive(Args)]
struct ScoreArgs {
    /// Prediction CSV with true labels
    #[arg(value_name = "PREDICTIONS")]
    predictions: PathBuf,

    /// Which prediction to score
    #[arg(long, value_enum, default_value_t = ScoredColumn::Flag)]
    column: ScoredColumn,
}

#[derive(Args)]
struct ShakyArgs {
    /// Prediction CSV with `true_modification_type`
    #[arg(value_name = "PREDICTIONS")]
    predictions: PathBuf,

    #[arg(long, value_enum, default_value_t = ScoredColumn::Flag)]
    column: ScoredColumn,

    /// Number of bootstrap trials
    #[arg(long, default_value = "1000")]
    trials: usize,

    /// Rows drawn per trial, split by the expected test class distribution
    #[arg(long, default_value = "5000")]
    bootstrap_size: usize,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Keep only a public-leaderboard sized subsample of every trial
    #[arg(long)]
    public: bool,

    /// Print every trial score as well as the summary
    #[arg(long)]
    all_scores: bool,
}

#[derive(Args)]
struct EnsembleInputs {
    /// Holdout prediction CSVs, one per model, with true labels
    #[arg(long, value_name = "CSV", num_args = 1.., required = true)]
    holdout: Vec<PathBuf>,

    /// Test prediction CSVs, in the same model order as --holdout
    #[arg(long, value_name = "CSV", num_args = 1.., required = true)]
    test: Vec<PathBuf>,

    /// CSV with a `quality` column aligned with the holdout rows
    #[arg(long, value_name = "CSV", requires = "test_quality")]
    holdout_quality: Option<PathBuf>,

    /// CSV with a `quality` column aligned with the test rows
    #[arg(long, value_name = "CSV", requires = "holdout_quality")]
    test_quality: Option<PathBuf>,

    /// Ensemble settings (.toml); flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of group folds
    #[arg(long)]
    folds: Option<usize>,

    /// Disable feature standardization
    #[arg(long)]
    no_standardize: bool,

    /// Build features without raw logits
    #[arg(long)]
    no_logits: bool,

    /// Ignore test-time-augmentation columns
    #[arg(long)]
    no_tta: bool,
}

#[derive(Args)]
struct StackArgs {
    #[command(flatten)]
    inputs: EnsembleInputs,

    /// Meta-model; defaults to the configured one
    #[arg(long, value_enum)]
    model: Option<MetaModelCli>,

    /// Submission path; defaults to `{model}_{cv}.csv`
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write the effective ensemble settings to this path
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    inputs: EnsembleInputs,

    /// Number of sampled grid points
    #[arg(long, default_value = "25")]
    n_iter: usize,

    /// Custom search grid (.toml)
    #[arg(long, value_name = "PATH")]
    grid: Option<PathBuf>,

    #[arg(long, default_value = "best_params.toml")]
    best_params: PathBuf,

    #[arg(long, default_value = "search_results.csv")]
    results: PathBuf,

    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "alaska2",
    about = "Weighted-AUC scoring and group-aware stacking for ALASKA2 steganalysis",
    long_about = "Scores prediction tables with the competition weighted AUC, estimates how \
                 much the score shakes across plausible test samples, and ensembles several \
                 models' holdout predictions into a submission."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Weighted AUC of one prediction table
    #[command(about = "Compute the weighted AUC of a prediction table")]
    Score(ScoreArgs),

    /// Bootstrap the weighted AUC under the expected test distribution
    #[command(about = "Estimate weighted-AUC stability by bootstrap")]
    Shaky(ShakyArgs),

    /// Cross-validated ensemble of several models
    #[command(about = "Fit a meta-model over model predictions (outputs: submission .csv)")]
    Stack(StackArgs),

    /// Randomized search over gradient-boosting hyperparameters
    #[command(about = "Search gradient-boosting hyperparameters (outputs: best_params.toml)")]
    Search(SearchArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Score(args)) => run_score(args),
        Some(Commands::Shaky(args)) => run_shaky(args),
        Some(Commands::Stack(args)) => run_stack(args),
        Some(Commands::Search(args)) => run_search(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn scored_predictions(table: &PredictionTable, column: ScoredColumn) -> Array1<f64> {
    match column {
        ScoredColumn::Flag => table.pred_flag.clone(),
        ScoredColumn::Type => classifier_logits_to_probas(table.pred_type.view()),
    }
}

fn run_score(args: ScoreArgs) -> CliResult {
    let table = PredictionTable::load(&args.predictions)?;
    let labels = table.binary_labels().ok_or_else(|| {
        format!(
            "{} has neither true_modification_flag nor true_modification_type",
            args.predictions.display()
        )
    })?;
    let predictions = scored_predictions(&table, args.column);

    let scorer = WeightedAuc::default();
    let score = scorer.score(labels.view(), predictions.view())?;
    let curve = roc_curve(labels.mapv(|v| v > 0).view(), predictions.view())?;
    println!("Rows: {}", table.len());
    println!("Weighted AUC: {score:.6}");
    for ((lo, hi, weight), area) in scorer
        .segments()
        .bands()
        .zip(scorer.segment_areas(&curve))
    {
        println!("  TPR [{lo:.2}, {hi:.2}] weight {weight}: area {area:.6}");
    }
    Ok(())
}

fn run_shaky(args: ShakyArgs) -> CliResult {
    let table = PredictionTable::load(&args.predictions)?;
    let labels = table.true_type.clone().ok_or_else(|| {
        format!(
            "{} has no true_modification_type column",
            args.predictions.display()
        )
    })?;
    let predictions = scored_predictions(&table, args.column);

    let mut config = BootstrapConfig {
        trials: args.trials,
        bootstrap_size: args.bootstrap_size,
        subsample_size: args.bootstrap_size,
        seed: args.seed,
        ..BootstrapConfig::default()
    };
    if args.public {
        config = config.public();
    }

    let estimator = BootstrapEstimator::new(config);
    let progress = TerminalProgress::new();
    let scores = estimator.estimate_with_progress(labels.view(), predictions.view(), &progress)?;
    if args.all_scores {
        for score in &scores {
            println!("{score:.6}");
        }
    }
    let summary =
        BootstrapSummary::from_scores(&scores).ok_or("the bootstrap produced no trial scores")?;
    println!(
        "Shaky wAUC over {} trials: mean {:.4} std {:.4} min {:.4} max {:.4} (5% {:.4}, 95% {:.4})",
        scores.len(),
        summary.mean,
        summary.std,
        summary.min,
        summary.max,
        summary.p05,
        summary.p95
    );
    Ok(())
}

fn load_tables(paths: &[PathBuf]) -> Result<Vec<PredictionTable>, TableError> {
    paths
        .par_iter()
        .map(|path| PredictionTable::load(path))
        .collect()
}

fn effective_config(inputs: &EnsembleInputs) -> Result<EnsembleConfig, Box<dyn std::error::Error>> {
    let mut config = match &inputs.config {
        Some(path) => EnsembleConfig::load(path)?,
        None => EnsembleConfig::default(),
    };
    if let Some(folds) = inputs.folds {
        config.folds = folds;
    }
    if inputs.no_standardize {
        config.standardize = false;
    }
    if inputs.no_logits {
        config.features.with_logits = false;
    }
    if inputs.no_tta {
        config.features.include_tta = false;
    }
    Ok(config)
}

fn prepare(
    inputs: &EnsembleInputs,
    config: &EnsembleConfig,
) -> Result<PreparedData, Box<dyn std::error::Error>> {
    if inputs.holdout.len() != inputs.test.len() {
        return Err(format!(
            "got {} holdout tables but {} test tables",
            inputs.holdout.len(),
            inputs.test.len()
        )
        .into());
    }
    println!("Loading {} models' predictions", inputs.holdout.len());
    let holdout: StackingInputs = build_features(&load_tables(&inputs.holdout)?, &config.features)?;
    let test: StackingInputs = build_features(&load_tables(&inputs.test)?, &config.features)?;
    println!(
        "Holdout: {} rows x {} features, test: {} rows",
        holdout.x.nrows(),
        holdout.x.ncols(),
        test.x.nrows()
    );

    let quality_holdout = inputs
        .holdout_quality
        .as_deref()
        .map(load_quality_factors)
        .transpose()?;
    let quality_test = inputs
        .test_quality
        .as_deref()
        .map(load_quality_factors)
        .transpose()?;
    Ok(prepare_matrices(
        &holdout,
        &test,
        quality_holdout.as_ref().map(|q| q.view()),
        quality_test.as_ref().map(|q| q.view()),
        config,
    )?)
}

fn save_submission(
    output: Option<PathBuf>,
    model: &str,
    mean_cv: f64,
    data: &PreparedData,
    predictions: &Array1<f64>,
) -> CliResult {
    let path = output.unwrap_or_else(|| PathBuf::from(default_submission_name(model, mean_cv)));
    write_submission(&path, &data.test_ids, predictions.view())?;
    println!("Submission written to {}", path.display());
    Ok(())
}

fn run_stack(args: StackArgs) -> CliResult {
    let mut config = effective_config(&args.inputs)?;
    if let Some(model) = args.model {
        config.model = model.into_model();
    }
    if let Some(path) = &args.save_config {
        config.save(path)?;
        println!("Ensemble settings written to {}", path.display());
    }

    let data = prepare(&args.inputs, &config)?;
    let progress = TerminalProgress::new();
    let outcome = cross_validate(
        data.x.view(),
        data.y.view(),
        &data.groups,
        data.x_test.view(),
        &config.model,
        config.folds,
        config.parallel_folds,
        &progress,
    )?;

    for fold in &outcome.folds {
        println!(
            "Fold {}: wAUC {:.4} ({} train / {} valid rows)",
            fold.fold, fold.score, fold.train_rows, fold.valid_rows
        );
        for (name, score) in &fold.components {
            println!("    {name}: {score:.4}");
        }
    }
    println!(
        "{} CV wAUC: {:.4} ± {:.4}",
        config.model.label(),
        outcome.mean,
        outcome.std
    );
    save_submission(
        args.output,
        config.model.label(),
        outcome.mean,
        &data,
        &outcome.test_predictions,
    )
}

fn run_search(args: SearchArgs) -> CliResult {
    let config = effective_config(&args.inputs)?;
    let grid = match &args.grid {
        Some(path) => toml::from_str::<ParamGrid>(&std::fs::read_to_string(path)?)?,
        None => ParamGrid::default(),
    };

    let data = prepare(&args.inputs, &config)?;
    let progress = TerminalProgress::new();
    let outcome = randomized_search(
        &data,
        &grid,
        args.n_iter,
        config.folds,
        config.seed,
        &progress,
    )?;

    let best = outcome.best();
    println!("Best mean wAUC {:.4} ± {:.4}", best.mean, best.std);
    println!("{}", toml::to_string_pretty(&best.params)?);
    outcome.write_best_params(&args.best_params)?;
    outcome.write_results(&args.results)?;
    println!(
        "Best parameters written to {}, all candidates to {}",
        args.best_params.display(),
        args.results.display()
    );
    save_submission(args.output, "xgb", best.mean, &data, &outcome.test_predictions)
}
