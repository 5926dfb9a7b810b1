use super::process::ProcessDescriptor;
use super::walker::ResetPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

/// A named class of external jobs sharing one program and one concurrency limit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub name: String,
    pub descriptor: ProcessDescriptor,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub root: PathBuf,
    pub executors: Vec<ExecutorConfig>,
}

#[derive(Default)]
pub struct ContextConfigBuilder {
    root: Option<PathBuf>,
    executors: Vec<ExecutorConfig>,
}

impl ContextConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }
    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn build(self) -> Result<ContextConfig, ConfigError> {
        let root = self.root.ok_or(ConfigError::MissingParameter("root"))?;
        for (i, executor) in self.executors.iter().enumerate() {
            if executor.max_concurrent == 0 {
                return Err(invalid("max_concurrent", format!("executor '{}' allows no jobs", executor.name)));
            }
            if self.executors[..i].iter().any(|e| e.name == executor.name) {
                return Err(invalid("executors", format!("duplicate executor '{}'", executor.name)));
            }
        }
        Ok(ContextConfig {
            root,
            executors: self.executors,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Total number of MD steps per propagation round.
    pub steps: u64,
    /// Stride between stored trajectory frames.
    pub step: u64,
    /// Number of initial steps excluded from the trajectory.
    pub start: u64,
    /// Force magnitude (eV/Å) above which a run is aborted.
    pub max_force: Option<f64>,
    pub keep_trajectory: bool,
    pub executor: String,
}

#[derive(Default)]
pub struct SamplingConfigBuilder {
    steps: Option<u64>,
    step: Option<u64>,
    start: Option<u64>,
    max_force: Option<f64>,
    keep_trajectory: Option<bool>,
    executor: Option<String>,
}

impl SamplingConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(mut self, steps: u64) -> Self {
        self.steps = Some(steps);
        self
    }
    pub fn step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }
    pub fn start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }
    pub fn max_force(mut self, max_force: f64) -> Self {
        self.max_force = Some(max_force);
        self
    }
    pub fn keep_trajectory(mut self, keep: bool) -> Self {
        self.keep_trajectory = Some(keep);
        self
    }
    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn build(self) -> Result<SamplingConfig, ConfigError> {
        let steps = self.steps.ok_or(ConfigError::MissingParameter("steps"))?;
        if steps == 0 {
            return Err(invalid("steps", "must be positive"));
        }
        let step = self.step.unwrap_or(steps);
        if step == 0 || step > steps {
            return Err(invalid("step", format!("must lie in 1..={steps}")));
        }
        let start = self.start.unwrap_or(0);
        if start >= steps {
            return Err(invalid("start", format!("must be smaller than {steps}")));
        }
        if let Some(f) = self.max_force {
            if f <= 0.0 {
                return Err(invalid("max_force", "must be positive"));
            }
        }
        Ok(SamplingConfig {
            steps,
            step,
            start,
            max_force: self.max_force,
            keep_trajectory: self.keep_trajectory.unwrap_or(false),
            executor: self.executor.unwrap_or_else(|| "sampler".to_string()),
        })
    }
}

/// Parameters of the sequential learning loop, persisted as `learning.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    pub niterations: usize,
    pub train_valid_split: f64,
    /// Energy (meV/atom) and force (meV/Å) errors above which a walker is reset.
    pub error_thresholds_for_reset: (f64, f64),
    pub pretraining_nstates: usize,
    /// Maximum displacement (Å) applied to walker starts during pretraining.
    pub pretraining_amplitude: f64,
    pub use_formation_energy: bool,
    pub atomic_energies_box_size: Option<f64>,
    pub train_from_scratch: bool,
    pub reset_policy: ResetPolicy,
    pub sampling: SamplingConfig,
}

#[derive(Default)]
pub struct LearningConfigBuilder {
    niterations: Option<usize>,
    train_valid_split: Option<f64>,
    error_thresholds_for_reset: Option<(f64, f64)>,
    pretraining_nstates: Option<usize>,
    pretraining_amplitude: Option<f64>,
    use_formation_energy: Option<bool>,
    atomic_energies_box_size: Option<f64>,
    train_from_scratch: Option<bool>,
    reset_policy: Option<ResetPolicy>,
    sampling: Option<SamplingConfig>,
}

impl LearningConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn niterations(mut self, n: usize) -> Self {
        self.niterations = Some(n);
        self
    }
    pub fn train_valid_split(mut self, fraction: f64) -> Self {
        self.train_valid_split = Some(fraction);
        self
    }
    pub fn error_thresholds_for_reset(mut self, energy: f64, forces: f64) -> Self {
        self.error_thresholds_for_reset = Some((energy, forces));
        self
    }
    pub fn pretraining_nstates(mut self, n: usize) -> Self {
        self.pretraining_nstates = Some(n);
        self
    }
    pub fn pretraining_amplitude(mut self, amplitude: f64) -> Self {
        self.pretraining_amplitude = Some(amplitude);
        self
    }
    pub fn use_formation_energy(mut self, enabled: bool) -> Self {
        self.use_formation_energy = Some(enabled);
        self
    }
    pub fn atomic_energies_box_size(mut self, size: f64) -> Self {
        self.atomic_energies_box_size = Some(size);
        self
    }
    pub fn train_from_scratch(mut self, enabled: bool) -> Self {
        self.train_from_scratch = Some(enabled);
        self
    }
    pub fn reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.reset_policy = Some(policy);
        self
    }
    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn build(self) -> Result<LearningConfig, ConfigError> {
        let train_valid_split = self.train_valid_split.unwrap_or(0.9);
        if !(train_valid_split > 0.0 && train_valid_split <= 1.0) {
            return Err(invalid("train_valid_split", "must lie in (0, 1]"));
        }
        let thresholds = self.error_thresholds_for_reset.unwrap_or((10.0, 200.0));
        if thresholds.0 <= 0.0 || thresholds.1 <= 0.0 {
            return Err(invalid("error_thresholds_for_reset", "thresholds must be positive"));
        }
        let amplitude = self.pretraining_amplitude.unwrap_or(0.05);
        if amplitude < 0.0 {
            return Err(invalid("pretraining_amplitude", "must not be negative"));
        }
        if let Some(size) = self.atomic_energies_box_size {
            if size <= 0.0 {
                return Err(invalid("atomic_energies_box_size", "must be positive"));
            }
        }
        Ok(LearningConfig {
            niterations: self
                .niterations
                .ok_or(ConfigError::MissingParameter("niterations"))?,
            train_valid_split,
            error_thresholds_for_reset: thresholds,
            pretraining_nstates: self.pretraining_nstates.unwrap_or(50),
            pretraining_amplitude: amplitude,
            use_formation_energy: self.use_formation_energy.unwrap_or(false),
            atomic_energies_box_size: self.atomic_energies_box_size,
            train_from_scratch: self.train_from_scratch.unwrap_or(true),
            reset_policy: self.reset_policy.unwrap_or_default(),
            sampling: self
                .sampling
                .ok_or(ConfigError::MissingParameter("sampling"))?,
        })
    }
}
