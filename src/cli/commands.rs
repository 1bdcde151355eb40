//! CLI command definitions

use clap::Args;

/// Run an experiment
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to experiment YAML file
    #[arg(short, long)]
    pub file: String,

    /// Override the configured number of pool workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Don't record the experiment in history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate an experiment configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to experiment YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show recorded experiments
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Number of recent experiments to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
