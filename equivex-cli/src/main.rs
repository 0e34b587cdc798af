//! Equivex CLI - explanation robustness experiments from the command line.

mod commands;
mod experiments;

use clap::{Parser, Subcommand};
use equivex_ml::ConfigOverrides;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Equivex: how robust are model explanations to input symmetries?
#[derive(Parser, Debug)]
#[command(name = "equivex", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace directory (holds `.equivex/config.toml`)
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Directory results are written to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory holding `<architecture>.ckpt` parameter files
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Seed for data generation and model initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Batch size for every forward pass
    #[arg(short, long)]
    pub batch_size: Option<u64>,

    /// Number of test examples to evaluate
    #[arg(long)]
    pub n_test: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Flags that take precedence over every configuration layer.
    pub fn overrides(&self) -> ConfigOverrides {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());
        ConfigOverrides::new()
            .set_opt("output.dir", path(&self.output))
            .set_opt("model.checkpoint_dir", path(&self.checkpoint_dir))
            .set_opt("data.seed", self.seed)
            .set_opt("model.seed", self.seed)
            .set_opt("data.batch_size", self.batch_size)
            .set_opt("data.n_test", self.n_test)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Model invariance and feature-attribution equivariance
    FeatureImportance,
    /// Invariance of example-based explanations
    ExampleImportance,
    /// Concept accuracy and invariance of concept explanations
    ConceptImportance,
    /// Invariance of concept explainers wrapped in an orbit average
    EnforceInvariance,
    /// Feature-attribution sensitivity against equivariance
    Sensitivity,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show the current configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match (cli.verbose, cli.quiet) {
        (_, true) => "error",
        (0, false) => "info",
        (1, false) => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "equivex", "equivex")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "equivex.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry().with(stderr_layer).with(file_layer).init();

    let workspace = std::fs::canonicalize(&cli.workspace).unwrap_or_else(|_| cli.workspace.clone());
    let overrides = cli.overrides();

    commands::handle_command(cli.command, &workspace, &overrides)
}
