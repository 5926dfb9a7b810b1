use super::config::ConfigError;
use super::process::ProcessError;
use crate::core::io::xyz::XyzError;
use crate::core::metrics::MetricsError;
use crate::core::potentials::plumed::PlumedError;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Invalid walker: {0}")]
    InvalidWalker(String),

    #[error("Invalid model operation: {0}")]
    InvalidModel(String),

    #[error("Invalid bias input: {source}")]
    Plumed {
        #[from]
        source: PlumedError,
    },

    #[error("Malformed {format} input: {message}")]
    Template {
        format: &'static str,
        message: String,
    },

    #[error("Invalid error query: {source}")]
    Metrics {
        #[from]
        source: MetricsError,
    },

    #[error("No atomic reference energy available for element {element}")]
    MissingAtomicEnergy { element: String },

    #[error("Every spin multiplicity failed for an isolated {element} atom")]
    AtomicEnergy { element: String },

    #[error("Process could not be launched: {source}")]
    Process {
        #[from]
        source: ProcessError,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read geometries from {path}: {source}")]
    Xyz { path: PathBuf, source: XyzError },

    #[error("Failed to parse {path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("{source}")]
    Task {
        #[from]
        source: TaskError,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure payload carried by deferred values.
///
/// Every consumer of a shared result observes the same (cloned) error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task '{task}' failed: {message}")]
pub struct TaskError {
    pub task: String,
    pub message: String,
}

impl TaskError {
    pub fn new(task: impl Into<String>, message: impl Display) -> Self {
        Self {
            task: task.into(),
            message: message.to_string(),
        }
    }
}
