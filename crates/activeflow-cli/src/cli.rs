use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Tony Kan, Ted Yu, William A. Goddard III, Victor Wai Tak Kam",
    version,
    about = "activeflow CLI - Active learning of machine-learned interatomic potentials: sample with the current model, label with a reference method, retrain, repeat.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for in-process parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run (or resume) a sequential learning campaign described by a configuration file.
    Run(RunArgs),
    /// Print per-structure errors between two labeled XYZ files.
    Errors(ErrorsArgs),
    /// Show the progress of a learning campaign from its output directory.
    Status(StatusArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the campaign configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Override `learning.output` from the config file.
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Override `learning.niterations` from the config file.
    #[arg(short = 'n', long, value_name = "INT")]
    pub iterations: Option<usize>,

    /// Override `learning.initial-data` from the config file.
    #[arg(long, value_name = "PATH")]
    pub initial_data: Option<PathBuf>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S sampling.steps=500
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `errors` subcommand.
#[derive(Args, Debug)]
pub struct ErrorsArgs {
    /// Labeled reference geometries (extended XYZ).
    #[arg(required = true, value_name = "REFERENCE")]
    pub reference: PathBuf,

    /// Predicted geometries; errors are computed against zero when omitted.
    #[arg(value_name = "PREDICTED")]
    pub predicted: Option<PathBuf>,

    /// Error statistic: mae, rmse or max.
    #[arg(short, long, default_value = "rmse")]
    pub metric: String,

    /// Properties to compare.
    #[arg(short, long, value_delimiter = ',', default_value = "energy,forces")]
    pub properties: Vec<String>,

    /// Restrict force errors to these elements.
    #[arg(short, long, value_delimiter = ',')]
    pub elements: Option<Vec<String>>,
}

/// Arguments for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output directory of a learning campaign.
    #[arg(short, long, required = true, value_name = "DIR")]
    pub output: PathBuf,
}
