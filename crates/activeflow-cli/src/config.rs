use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use activeflow::core::metrics::Property;
use activeflow::engine::config::{
    self as core_config, ContextConfigBuilder, ExecutorConfig, LearningConfigBuilder,
    SamplingConfigBuilder,
};
use activeflow::engine::process::{ProcessDescriptor, WorkdirPolicy};
use activeflow::engine::walker::ResetPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONTEXT_ROOT: &str = "activeflow-context";
const DEFAULT_OUTPUT: &str = "output";

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialContextConfig {
    root: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialExecutorConfig {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    max_concurrent: Option<usize>,
    /// Seconds.
    walltime: Option<f64>,
    workdir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialReferenceConfig {
    cp2k_input: Option<PathBuf>,
    properties: Option<Vec<Property>>,
    executor: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialModelConfig {
    name: Option<String>,
    executor: Option<String>,
    config: Option<toml::Table>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialReplicaExchangeConfig {
    trial_frequency: u64,
    #[serde(default)]
    rescale_kinetic: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialWalkersConfig {
    start: Option<PathBuf>,
    count: Option<usize>,
    temperature: Option<f64>,
    pressure: Option<f64>,
    timestep: Option<f64>,
    nbeads: Option<usize>,
    plumed: Option<PathBuf>,
    replica_exchange: Option<PartialReplicaExchangeConfig>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialLearningConfig {
    output: Option<PathBuf>,
    initial_data: Option<PathBuf>,
    niterations: Option<usize>,
    train_valid_split: Option<f64>,
    error_thresholds_for_reset: Option<(f64, f64)>,
    pretraining_nstates: Option<usize>,
    pretraining_amplitude: Option<f64>,
    use_formation_energy: Option<bool>,
    atomic_energies_box_size: Option<f64>,
    train_from_scratch: Option<bool>,
    reset_policy: Option<ResetPolicy>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialSamplingConfig {
    steps: Option<u64>,
    step: Option<u64>,
    start: Option<u64>,
    max_force: Option<f64>,
    keep_trajectory: Option<bool>,
    executor: Option<String>,
}

/// A campaign configuration file as written by the user; every section is optional
/// until merged with the command line.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRunConfig {
    context: Option<PartialContextConfig>,
    executors: Option<BTreeMap<String, PartialExecutorConfig>>,
    reference: Option<PartialReferenceConfig>,
    model: Option<PartialModelConfig>,
    walkers: Option<PartialWalkersConfig>,
    learning: Option<PartialLearningConfig>,
    sampling: Option<PartialSamplingConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSetup {
    pub cp2k_input: PathBuf,
    pub properties: Vec<Property>,
    pub executor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSetup {
    pub name: String,
    pub executor: String,
    pub config: toml::Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkerSetup {
    pub start: PathBuf,
    pub count: Option<usize>,
    pub temperature: f64,
    pub pressure: Option<f64>,
    pub timestep: Option<f64>,
    pub nbeads: Option<usize>,
    pub plumed: Option<PathBuf>,
    /// `(trial frequency, rescale kinetic energy)`.
    pub replica_exchange: Option<(u64, bool)>,
}

/// Everything `activeflow run` needs, with paths resolved.
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub context: core_config::ContextConfig,
    pub learning: core_config::LearningConfig,
    pub output: PathBuf,
    pub initial_data: Option<PathBuf>,
    pub reference: ReferenceSetup,
    pub model: ModelSetup,
    pub walkers: WalkerSetup,
}

/// Relative paths in a config file are relative to the file itself.
fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() { path } else { base.join(path) }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {}: {}", key, value)))
}

fn parse_reset_policy(value: &str) -> Result<ResetPolicy> {
    match value {
        "conditional" => Ok(ResetPolicy::Conditional),
        "always" => Ok(ResetPolicy::Always),
        "never" => Ok(ResetPolicy::Never),
        other => Err(CliError::Config(format!(
            "Invalid reset policy '{}' (expected conditional, always or never)",
            other
        ))),
    }
}

/// Directory relative config paths are resolved against.
pub fn config_base(config: &Path) -> PathBuf {
    config.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// The campaign output directory a `run` invocation will use.
pub fn resolve_output(args: &RunArgs) -> Result<PathBuf> {
    let mut partial = PartialRunConfig::from_file(&args.config)?;
    partial.apply_set_values(&args.set_values)?;
    Ok(partial.output_dir(args, &config_base(&args.config)))
}

impl PartialRunConfig {
    fn output_dir(&self, args: &RunArgs, base: &Path) -> PathBuf {
        args.output.clone().unwrap_or_else(|| {
            let configured = self.learning.as_ref().and_then(|l| l.output.clone());
            resolve_path(base, configured.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)))
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| match e {
            CliError::Other(source) => CliError::FileParsing {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::Other(e.into()))
    }

    pub fn merge_with_cli(mut self, args: &RunArgs, base: &Path) -> Result<RunSetup> {
        self.apply_set_values(&args.set_values)?;
        let output = self.output_dir(args, base);

        let context = self.context.take().unwrap_or_default();
        let executors = self.executors.take().unwrap_or_default();
        let reference = self.reference.take().unwrap_or_default();
        let model = self.model.take().unwrap_or_default();
        let walkers = self.walkers.take().unwrap_or_default();
        let learning = self.learning.take().unwrap_or_default();
        let sampling = self.sampling.take().unwrap_or_default();

        let context = Self::merge_context(context, executors, base)?;
        let learning_config = Self::merge_learning(&learning, sampling, args)?;

        let initial_data = args
            .initial_data
            .clone()
            .or_else(|| learning.initial_data.map(|p| resolve_path(base, p)));

        let reference = ReferenceSetup {
            cp2k_input: reference
                .cp2k_input
                .map(|p| resolve_path(base, p))
                .ok_or_else(|| CliError::Config("`reference.cp2k-input` is required.".to_string()))?,
            properties: reference
                .properties
                .unwrap_or_else(|| vec![Property::Energy, Property::Forces]),
            executor: reference.executor.unwrap_or_else(|| "reference".to_string()),
        };
        let model = ModelSetup {
            name: model
                .name
                .ok_or_else(|| CliError::Config("`model.name` is required.".to_string()))?,
            executor: model.executor.unwrap_or_else(|| "model".to_string()),
            config: model.config.unwrap_or_default(),
        };
        let walkers = WalkerSetup {
            start: walkers
                .start
                .map(|p| resolve_path(base, p))
                .ok_or_else(|| CliError::Config("`walkers.start` is required.".to_string()))?,
            count: walkers.count,
            temperature: walkers.temperature.unwrap_or(300.0),
            pressure: walkers.pressure,
            timestep: walkers.timestep,
            nbeads: walkers.nbeads,
            plumed: walkers.plumed.map(|p| resolve_path(base, p)),
            replica_exchange: walkers
                .replica_exchange
                .map(|r| (r.trial_frequency, r.rescale_kinetic)),
        };

        Ok(RunSetup {
            context,
            learning: learning_config,
            output,
            initial_data,
            reference,
            model,
            walkers,
        })
    }

    fn merge_context(
        context: PartialContextConfig,
        executors: BTreeMap<String, PartialExecutorConfig>,
        base: &Path,
    ) -> Result<core_config::ContextConfig> {
        if executors.is_empty() {
            return Err(CliError::Config(
                "At least one `[executors.<name>]` section is required.".to_string(),
            ));
        }
        let root = resolve_path(
            base,
            context.root.unwrap_or_else(|| PathBuf::from(DEFAULT_CONTEXT_ROOT)),
        );
        let mut builder = ContextConfigBuilder::new().root(root);
        for (name, partial) in executors {
            let mut descriptor = ProcessDescriptor::new(partial.program);
            for arg in partial.args {
                descriptor = descriptor.arg(arg);
            }
            for (key, value) in partial.env {
                descriptor = descriptor.env(key, value);
            }
            if let Some(seconds) = partial.walltime {
                let walltime = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    CliError::Config(format!("Invalid walltime for executor '{}': {}", name, seconds))
                })?;
                descriptor = descriptor.walltime(walltime);
            }
            if let Some(dir) = partial.workdir {
                descriptor = descriptor.workdir(WorkdirPolicy::Within(resolve_path(base, dir)));
            }
            builder = builder.executor(ExecutorConfig {
                name,
                descriptor,
                max_concurrent: partial.max_concurrent.unwrap_or(1),
            });
        }
        builder.build().map_err(|e| CliError::Config(e.to_string()))
    }

    fn merge_learning(
        learning: &PartialLearningConfig,
        sampling: PartialSamplingConfig,
        args: &RunArgs,
    ) -> Result<core_config::LearningConfig> {
        let mut sampling_builder = SamplingConfigBuilder::new();
        if let Some(steps) = sampling.steps {
            sampling_builder = sampling_builder.steps(steps);
        }
        if let Some(step) = sampling.step {
            sampling_builder = sampling_builder.step(step);
        }
        if let Some(start) = sampling.start {
            sampling_builder = sampling_builder.start(start);
        }
        if let Some(max_force) = sampling.max_force {
            sampling_builder = sampling_builder.max_force(max_force);
        }
        if let Some(keep) = sampling.keep_trajectory {
            sampling_builder = sampling_builder.keep_trajectory(keep);
        }
        if let Some(executor) = sampling.executor {
            sampling_builder = sampling_builder.executor(executor);
        }
        let sampling = sampling_builder
            .build()
            .map_err(|e| CliError::Config(format!("[sampling] {}", e)))?;

        let mut builder = LearningConfigBuilder::new().sampling(sampling);
        if let Some(n) = args.iterations.or(learning.niterations) {
            builder = builder.niterations(n);
        }
        if let Some(fraction) = learning.train_valid_split {
            builder = builder.train_valid_split(fraction);
        }
        if let Some((energy, forces)) = learning.error_thresholds_for_reset {
            builder = builder.error_thresholds_for_reset(energy, forces);
        }
        if let Some(n) = learning.pretraining_nstates {
            builder = builder.pretraining_nstates(n);
        }
        if let Some(amplitude) = learning.pretraining_amplitude {
            builder = builder.pretraining_amplitude(amplitude);
        }
        if let Some(enabled) = learning.use_formation_energy {
            builder = builder.use_formation_energy(enabled);
        }
        if let Some(size) = learning.atomic_energies_box_size {
            builder = builder.atomic_energies_box_size(size);
        }
        if let Some(enabled) = learning.train_from_scratch {
            builder = builder.train_from_scratch(enabled);
        }
        if let Some(policy) = learning.reset_policy {
            builder = builder.reset_policy(policy);
        }
        builder
            .build()
            .map_err(|e| CliError::Config(format!("[learning] {}", e)))
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };
            let learning = || PartialLearningConfig::default();
            match key {
                "learning.niterations" => {
                    self.learning.get_or_insert_with(learning).niterations =
                        Some(parse_value(key, value)?);
                }
                "learning.train-valid-split" => {
                    self.learning.get_or_insert_with(learning).train_valid_split =
                        Some(parse_value(key, value)?);
                }
                "learning.pretraining-nstates" => {
                    self.learning.get_or_insert_with(learning).pretraining_nstates =
                        Some(parse_value(key, value)?);
                }
                "learning.train-from-scratch" => {
                    self.learning.get_or_insert_with(learning).train_from_scratch =
                        Some(parse_value(key, value)?);
                }
                "learning.reset-policy" => {
                    self.learning.get_or_insert_with(learning).reset_policy =
                        Some(parse_reset_policy(value)?);
                }
                "sampling.steps" => {
                    self.sampling.get_or_insert_with(Default::default).steps =
                        Some(parse_value(key, value)?);
                }
                "sampling.step" => {
                    self.sampling.get_or_insert_with(Default::default).step =
                        Some(parse_value(key, value)?);
                }
                "sampling.max-force" => {
                    self.sampling.get_or_insert_with(Default::default).max_force =
                        Some(parse_value(key, value)?);
                }
                "walkers.count" => {
                    self.walkers.get_or_insert_with(Default::default).count =
                        Some(parse_value(key, value)?);
                }
                "walkers.temperature" => {
                    self.walkers.get_or_insert_with(Default::default).temperature =
                        Some(parse_value(key, value)?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    const CAMPAIGN: &str = r#"
[context]
root = "work"

[executors.reference]
program = "cp2k.psmp"
args = ["-i", "cp2k.inp"]
env = { OMP_NUM_THREADS = "1" }
max-concurrent = 8
walltime = 3600

[executors.sampler]
program = "activeflow-sampler"

[executors.model]
program = "mace-trainer"

[reference]
cp2k-input = "cp2k.inp"

[model]
name = "mace"

[model.config]
r_max = 5.0

[walkers]
start = "start.xyz"
count = 4
temperature = 600.0
plumed = "plumed.dat"

[walkers.replica-exchange]
trial-frequency = 50

[learning]
niterations = 5
error-thresholds-for-reset = [20.0, 300.0]
reset-policy = "always"

[sampling]
steps = 1000
step = 100
"#;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["activeflow", "run", "--config", "campaign.toml"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn output_directory_is_resolved_next_to_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("campaign.toml");
        std::fs::write(&config, "[learning]\noutput = \"runs\"\n").unwrap();
        let mut args = run_args(&[]);
        args.config = config;
        assert_eq!(resolve_output(&args).unwrap(), dir.path().join("runs"));

        args.output = Some(PathBuf::from("elsewhere"));
        assert_eq!(resolve_output(&args).unwrap(), PathBuf::from("elsewhere"));

        args.config = dir.path().join("missing.toml");
        assert!(resolve_output(&args).is_err());
    }

    #[test]
    fn full_file_merges_into_core_configuration() {
        let partial = PartialRunConfig::from_toml(CAMPAIGN).unwrap();
        let setup = partial.merge_with_cli(&run_args(&[]), Path::new("/campaign")).unwrap();

        assert_eq!(setup.context.root, PathBuf::from("/campaign/work"));
        assert_eq!(setup.context.executors.len(), 3);
        let reference = setup
            .context
            .executors
            .iter()
            .find(|e| e.name == "reference")
            .unwrap();
        assert_eq!(reference.max_concurrent, 8);
        assert_eq!(reference.descriptor.args, vec!["-i", "cp2k.inp"]);
        assert_eq!(reference.descriptor.walltime, Some(Duration::from_secs(3600)));

        assert_eq!(setup.learning.niterations, 5);
        assert_eq!(setup.learning.error_thresholds_for_reset, (20.0, 300.0));
        assert_eq!(setup.learning.reset_policy, ResetPolicy::Always);
        assert_eq!(setup.learning.sampling.steps, 1000);
        assert_eq!(setup.output, PathBuf::from("/campaign/output"));

        assert_eq!(setup.reference.cp2k_input, PathBuf::from("/campaign/cp2k.inp"));
        assert_eq!(setup.reference.properties, vec![Property::Energy, Property::Forces]);
        assert_eq!(setup.model.config.get("r_max"), Some(&toml::Value::Float(5.0)));
        assert_eq!(setup.walkers.count, Some(4));
        assert_eq!(setup.walkers.temperature, 600.0);
        assert_eq!(setup.walkers.replica_exchange, Some((50, false)));
        assert_eq!(setup.walkers.plumed, Some(PathBuf::from("/campaign/plumed.dat")));
    }

    #[test]
    fn command_line_overrides_take_precedence() {
        let partial = PartialRunConfig::from_toml(CAMPAIGN).unwrap();
        let args = run_args(&[
            "-n",
            "2",
            "--output",
            "elsewhere",
            "-S",
            "sampling.steps=200",
            "-S",
            "learning.reset-policy=never",
        ]);
        let setup = partial.merge_with_cli(&args, Path::new("/campaign")).unwrap();
        assert_eq!(setup.learning.niterations, 2);
        assert_eq!(setup.learning.sampling.steps, 200);
        assert_eq!(setup.learning.reset_policy, ResetPolicy::Never);
        assert_eq!(setup.output, PathBuf::from("elsewhere"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = PartialRunConfig::from_toml("[learning]\nniterations = 1\nbogus = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_required_sections_are_reported() {
        let partial = PartialRunConfig::from_toml("[executors.reference]\nprogram = \"cp2k\"\n").unwrap();
        let result = partial.merge_with_cli(&run_args(&["-n", "1", "-S", "sampling.steps=10"]), Path::new("."));
        assert!(matches!(result, Err(CliError::Config(message)) if message.contains("cp2k-input")));
    }

    #[test]
    fn invalid_set_values_are_rejected() {
        let mut partial = PartialRunConfig::default();
        assert!(partial.apply_set_values(&["sampling.steps".to_string()]).is_err());
        assert!(partial.apply_set_values(&["sampling.steps=many".to_string()]).is_err());
        assert!(partial.apply_set_values(&["model.name=mace".to_string()]).is_err());
        assert!(partial.apply_set_values(&["learning.reset-policy=sometimes".to_string()]).is_err());
    }
}
