use crate::cli::{Cli, Commands};
use crate::config;
use crate::error::{CliError, Result};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing_subscriber::{Layer, filter::LevelFilter, fmt, prelude::*};

/// Log kept inside a campaign's output directory across resumed runs.
pub const CAMPAIGN_LOG_FILE: &str = "activeflow.log";

/// Where file logs go, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFile {
    /// `--log-file`; truncated on startup.
    Explicit(PathBuf),
    /// `<output>/activeflow.log` of a `run`; appended to.
    Campaign(PathBuf),
}

impl LogFile {
    fn open(&self) -> std::io::Result<File> {
        match self {
            LogFile::Explicit(path) => File::create(path),
            LogFile::Campaign(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                OpenOptions::new().create(true).append(true).open(path)
            }
        }
    }
}

/// An explicit `--log-file` wins; otherwise `run` logs into its output directory.
pub fn log_target(cli: &Cli) -> Option<LogFile> {
    if let Some(path) = &cli.log_file {
        return Some(LogFile::Explicit(path.clone()));
    }
    match &cli.command {
        Commands::Run(args) => config::resolve_output(args)
            .ok()
            .map(|output| LogFile::Campaign(output.join(CAMPAIGN_LOG_FILE))),
        _ => None,
    }
}

fn console_level(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::ERROR;
    }
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Files always record iteration and checkpoint events, whatever the console shows.
fn file_level(verbosity: u8) -> LevelFilter {
    console_level(verbosity, false).max(LevelFilter::INFO)
}

pub fn setup_logging(verbosity: u8, quiet: bool, target: Option<LogFile>) -> Result<()> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .compact()
        .with_filter(console_level(verbosity, quiet));

    let file = match &target {
        Some(target) => Some(
            fmt::layer()
                .with_writer(target.open().map_err(CliError::Io)?)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_target(true)
                .with_filter(file_level(verbosity)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use std::path::Path;
    use tracing::info;

    #[test]
    fn verbosity_maps_to_console_levels() {
        assert_eq!(console_level(0, false), LevelFilter::WARN);
        assert_eq!(console_level(1, false), LevelFilter::INFO);
        assert_eq!(console_level(2, false), LevelFilter::DEBUG);
        assert_eq!(console_level(7, false), LevelFilter::TRACE);
        assert_eq!(console_level(3, true), LevelFilter::ERROR);
    }

    #[test]
    fn file_never_drops_below_info() {
        assert_eq!(file_level(0), LevelFilter::INFO);
        assert_eq!(file_level(2), LevelFilter::DEBUG);
    }

    #[test]
    fn explicit_log_file_takes_precedence() {
        let cli = Cli::parse_from(["activeflow", "--log-file", "debug.log", "status", "-o", "out"]);
        assert_eq!(log_target(&cli), Some(LogFile::Explicit(PathBuf::from("debug.log"))));

        let cli = Cli::parse_from(["activeflow", "status", "-o", "out"]);
        assert_eq!(log_target(&cli), None);
    }

    #[test]
    fn run_logs_into_its_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("campaign.toml");
        std::fs::write(&config, "[learning]\noutput = \"runs\"\n").unwrap();
        let cli = Cli::parse_from(["activeflow", "run", "--config", config.to_str().unwrap()]);
        assert_eq!(
            log_target(&cli),
            Some(LogFile::Campaign(dir.path().join("runs").join(CAMPAIGN_LOG_FILE)))
        );

        let cli = Cli::parse_from(["activeflow", "run", "--config", "absent.toml"]);
        assert_eq!(log_target(&cli), None);
    }

    fn record(target: &LogFile, message: &str) {
        let layer = fmt::layer()
            .with_writer(target.open().unwrap())
            .with_ansi(false)
            .with_filter(file_level(0));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            info!(iteration = 3, "{}", message);
            tracing::debug!("filtered out");
        });
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    #[serial]
    fn campaign_log_is_appended_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join(CAMPAIGN_LOG_FILE);
        let target = LogFile::Campaign(path.clone());
        record(&target, "First run");
        record(&target, "Resumed run");

        let content = read(&path);
        assert!(content.contains("First run"));
        assert!(content.contains("Resumed run"));
        assert!(content.contains("iteration=3"));
        assert!(!content.contains("filtered out"));
    }

    #[test]
    #[serial]
    fn explicit_log_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let target = LogFile::Explicit(path.clone());
        record(&target, "First run");
        record(&target, "Second run");

        let content = read(&path);
        assert!(!content.contains("First run"));
        assert!(content.contains("Second run"));
    }

    #[test]
    #[serial]
    fn unwritable_log_file_is_an_io_error() {
        if cfg!(unix) && Path::new("/").is_dir() {
            let result = setup_logging(0, false, Some(LogFile::Explicit(PathBuf::from("/"))));
            assert!(matches!(result, Err(CliError::Io(_))));
        }
    }
}
