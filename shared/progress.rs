use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Stages reported while estimating score stability or searching hyperparameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    BootstrapTrials,
    CrossValidation,
    ParameterSearch,
}

impl ProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::BootstrapTrials => "bootstrap trials",
            Self::CrossValidation => "cross-validation folds",
            Self::ParameterSearch => "hyperparameter candidates",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress. Calls may arrive from several rayon workers at once,
/// so every method takes `&self`.
pub trait ProgressObserver: Sync {
    fn on_stage_start(&self, stage: ProgressStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_stage_advance(&self, stage: ProgressStage, advanced: usize) {
        let _ = (stage, advanced);
    }
    fn on_stage_finish(&self, stage: ProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Progress bar on stderr. Hidden when stderr is not a terminal.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_stage_start(&self, stage: ProgressStage, total: usize) {
        self.bar.reset();
        self.bar.set_length(total as u64);
        self.bar.set_message(stage.describe());
    }

    fn on_stage_advance(&self, stage: ProgressStage, advanced: usize) {
        let _ = stage;
        self.bar.inc(advanced as u64);
    }

    fn on_stage_finish(&self, stage: ProgressStage) {
        self.bar.finish_with_message(format!("{stage} done"));
    }
}
