use super::config::SamplingConfig;
use super::context::ExecutionContext;
use super::dataset::{Dataset, read_geometries, write_geometries};
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use super::hamiltonian::{ComponentEntry, Hamiltonian};
use super::process::{ExitKind, InputFile, ProcessError};
use super::walker::{Coupling, Walker, partition};
use crate::core::models::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

pub const INPUT_FILE: &str = "sampler.toml";
pub const WEIGHTS_FILE: &str = "weights.csv";
pub const STATUS_FILE: &str = "status.csv";

/// How a propagation round ended for one walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Success = 0,
    /// Walltime exceeded; the last stored frame is still usable.
    Timeout = 1,
    ForceExceeded = 2,
    Failed = 3,
}

impl RunStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RunStatus::Success),
            1 => Some(RunStatus::Timeout),
            2 => Some(RunStatus::ForceExceeded),
            3 => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// Whether a walker may continue from the state reached in this run.
    pub fn keeps_state(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Timeout)
    }
}

/// Number of walkers per [`RunStatus`] in one sampling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounts {
    pub success: usize,
    pub timeout: usize,
    pub force_exceeded: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally(statuses: &[RunStatus]) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts += *status;
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.success + self.timeout + self.force_exceeded + self.failed
    }
}

impl AddAssign<RunStatus> for StatusCounts {
    fn add_assign(&mut self, status: RunStatus) {
        match status {
            RunStatus::Success => self.success += 1,
            RunStatus::Timeout => self.timeout += 1,
            RunStatus::ForceExceeded => self.force_exceeded += 1,
            RunStatus::Failed => self.failed += 1,
        }
    }
}

impl AddAssign for StatusCounts {
    fn add_assign(&mut self, other: Self) {
        self.success += other.success;
        self.timeout += other.timeout;
        self.force_exceeded += other.force_exceeded;
        self.failed += other.failed;
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} timed out, {} exceeded the force limit, {} failed",
            self.success, self.timeout, self.force_exceeded, self.failed
        )
    }
}

/// Per-walker result of [`sample`].
#[derive(Debug, Clone)]
pub struct SimulationOutput {
    pub status: Deferred<RunStatus>,
    pub state: Deferred<Geometry>,
    /// Simulated time in picoseconds.
    pub time: Deferred<f64>,
    pub trajectory: Option<Dataset>,
}

/// Components and weights shared by the walkers of one sampler run.
#[derive(Debug, Clone)]
pub struct Template {
    pub names: Vec<String>,
    pub components: Vec<Hamiltonian>,
    /// `TEMP`, `PRESSURE` when the ensemble needs them, then component names.
    pub header: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Template {
    pub fn to_csv(&self) -> Result<String, EngineError> {
        let malformed = |message: String| EngineError::Template {
            format: "csv",
            message,
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.header)
            .map_err(|e| malformed(e.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(f64::to_string))
                .map_err(|e| malformed(e.to_string()))?;
        }
        let bytes = writer.into_inner().map_err(|e| malformed(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| malformed(e.to_string()))
    }
}

/// Collects the distinct components of similar walkers and their per-walker weights.
pub fn template(walkers: &[Walker]) -> Result<Template, EngineError> {
    let first = walkers
        .first()
        .ok_or_else(|| EngineError::InvalidWalker("no walkers to template".into()))?;
    if partition(walkers).len() != 1 {
        return Err(EngineError::InvalidWalker(
            "walkers of one sampler run must be mutually similar".into(),
        ));
    }
    let union: Hamiltonian = walkers.iter().map(|w| w.hamiltonian.clone()).sum();
    let (names, components): (Vec<String>, Vec<Hamiltonian>) =
        union.canonical().into_iter().map(|(name, h, _)| (name, h)).unzip();
    if components.is_empty() {
        return Err(EngineError::InvalidWalker(
            "walkers have no hamiltonian components".into(),
        ));
    }

    let mut header = Vec::new();
    if first.temperature().is_some() {
        header.push("TEMP".to_string());
    }
    if first.pressure().is_some() {
        header.push("PRESSURE".to_string());
    }
    header.extend(names.iter().cloned());

    let rows: Vec<Vec<f64>> = walkers
        .iter()
        .map(|walker| {
            walker
                .temperature()
                .into_iter()
                .chain(walker.pressure())
                .chain(walker.hamiltonian.get_coefficients(&components))
                .collect::<Vec<f64>>()
        })
        .collect();
    Ok(Template {
        names,
        components,
        header,
        rows,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensemble {
    Nve,
    Nvt,
    Npt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThermostatMode {
    #[serde(rename = "langevin")]
    Langevin,
    #[serde(rename = "pile_g")]
    PileG,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thermostat {
    pub mode: ThermostatMode,
    /// Friction time constant in fs.
    pub friction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Barostat {
    pub mode: &'static str,
    /// Relaxation time in fs.
    pub tau: f64,
    pub thermostat: Thermostat,
}

/// Integrator settings of a walker as passed to the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionSettings {
    pub mode: Ensemble,
    /// fs
    pub timestep: f64,
    pub nbeads: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thermostat: Option<Thermostat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barostat: Option<Barostat>,
}

impl MotionSettings {
    const FRICTION: f64 = 100.0;
    const BAROSTAT_TAU: f64 = 200.0;

    pub fn for_walker(walker: &Walker) -> Self {
        let langevin = Thermostat {
            mode: ThermostatMode::Langevin,
            friction: Self::FRICTION,
        };
        let thermostat = if walker.pimd() {
            Thermostat {
                mode: ThermostatMode::PileG,
                friction: Self::FRICTION,
            }
        } else {
            langevin
        };
        let (mode, thermostat, barostat) = if walker.npt() {
            let barostat = Barostat {
                mode: "flexible",
                tau: Self::BAROSTAT_TAU,
                thermostat: langevin,
            };
            (Ensemble::Npt, Some(thermostat), Some(barostat))
        } else if walker.nvt() {
            (Ensemble::Nvt, Some(thermostat), None)
        } else {
            (Ensemble::Nve, None, None)
        };
        Self {
            mode,
            timestep: walker.timestep(),
            nbeads: walker.nbeads(),
            thermostat,
            barostat,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ReplicaExchangeSettings {
    trial_frequency: u64,
    rescale_kinetic: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SamplerInput {
    steps: u64,
    step: u64,
    start: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_force: Option<f64>,
    nwalkers: usize,
    weights: &'static str,
    motion: MotionSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    replica_exchange: Option<ReplicaExchangeSettings>,
    components: Vec<ComponentEntry>,
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    walker: usize,
    status: u8,
    time: f64,
}

#[derive(Debug, Clone)]
struct WalkerResult {
    status: RunStatus,
    state: Geometry,
    time: f64,
    trajectory: Option<PathBuf>,
}

/// Everything needed to launch one partition, fixed at graph-construction time.
struct Bundle {
    executor: String,
    names: Vec<String>,
    components: Vec<Hamiltonian>,
    weights: String,
    input: SamplerInput,
    states: Vec<Deferred<Geometry>>,
    timestep: f64,
    trajectories: Option<Vec<PathBuf>>,
}

impl Bundle {
    fn new(ctx: &ExecutionContext, walkers: &[Walker], config: &SamplingConfig) -> Result<Self, EngineError> {
        let template = template(walkers)?;
        let weights = template.to_csv()?;
        let first = &walkers[0];
        let replica_exchange = first.coupling().map(|coupling| match *coupling {
            Coupling::ReplicaExchange {
                trial_frequency,
                rescale_kinetic,
                ..
            } => ReplicaExchangeSettings {
                trial_frequency,
                rescale_kinetic,
            },
        });
        let input = SamplerInput {
            steps: config.steps,
            step: config.step,
            start: config.start,
            max_force: config.max_force,
            nwalkers: walkers.len(),
            weights: WEIGHTS_FILE,
            motion: MotionSettings::for_walker(first),
            replica_exchange,
            components: Vec::new(),
        };
        let trajectories = config
            .keep_trajectory
            .then(|| walkers.iter().map(|_| ctx.new_file("trajectory_", ".xyz")).collect());
        Ok(Self {
            executor: config.executor.clone(),
            names: template.names,
            components: template.components,
            weights,
            input,
            states: walkers.iter().map(|w| w.state().clone()).collect(),
            timestep: first.timestep(),
            trajectories,
        })
    }

    fn nwalkers(&self) -> usize {
        self.states.len()
    }
}

fn check_couplings(walkers: &[Walker], partitions: &[Vec<usize>]) -> Result<(), EngineError> {
    let mut owners: HashMap<u64, usize> = HashMap::new();
    for (p, indices) in partitions.iter().enumerate() {
        for coupling in indices.iter().filter_map(|&i| walkers[i].coupling()) {
            let owner = *owners.entry(coupling.group()).or_insert(p);
            if owner != p {
                return Err(EngineError::InvalidWalker(format!(
                    "coupled walkers of group {} would be propagated by different sampler runs",
                    coupling.group()
                )));
            }
        }
    }
    Ok(())
}

/// Propagates every walker and updates its state.
///
/// Walkers are grouped with [`partition`]; each group becomes a single sampler
/// job. A job that cannot run or exits abnormally marks only its own walkers
/// as [`RunStatus::Failed`].
#[instrument(skip_all, name = "sample")]
pub fn sample(
    ctx: &ExecutionContext,
    walkers: &mut [Walker],
    config: &SamplingConfig,
) -> Result<Vec<SimulationOutput>, EngineError> {
    if !ctx.has_executor(&config.executor) {
        return Err(ProcessError::UnknownExecutor(config.executor.clone()).into());
    }
    let partitions = partition(walkers);
    check_couplings(walkers, &partitions)?;

    let mut outputs: Vec<Option<SimulationOutput>> = vec![None; walkers.len()];
    for indices in &partitions {
        let members: Vec<Walker> = indices.iter().map(|&i| walkers[i].clone()).collect();
        let bundle = Bundle::new(ctx, &members, config)?;
        debug!(
            walkers = indices.len(),
            components = ?bundle.names,
            "Prepared sampler input"
        );
        let results = submit_partition(ctx, bundle);
        for (slot, &index) in indices.iter().enumerate() {
            let result = results.try_map(move |results: Vec<WalkerResult>| {
                results
                    .get(slot)
                    .cloned()
                    .ok_or_else(|| TaskError::new("sampling", format!("missing result for walker {slot}")))
            });
            let trajectory = config.keep_trajectory.then(|| {
                let file = result.try_map(|r| {
                    r.trajectory
                        .ok_or_else(|| TaskError::new("sampling", "trajectory was not kept"))
                });
                Dataset::from_deferred(ctx, file)
            });
            outputs[index] = Some(SimulationOutput {
                status: result.map(|r| r.status),
                state: result.map(|r| r.state),
                time: result.map(|r| r.time),
                trajectory,
            });
        }
    }

    let outputs = outputs
        .into_iter()
        .map(|o| o.ok_or_else(|| EngineError::Internal("walker missing from every partition".into())))
        .collect::<Result<Vec<_>, _>>()?;
    for (walker, output) in walkers.iter_mut().zip(&outputs) {
        walker.update(output);
    }
    info!(
        walkers = outputs.len(),
        partitions = partitions.len(),
        steps = config.steps,
        "Submitted sampling round"
    );
    Ok(outputs)
}

fn submit_partition(ctx: &ExecutionContext, bundle: Bundle) -> Deferred<Vec<WalkerResult>> {
    let task = ctx.clone();
    ctx.submit("sampling", async move {
        match run_partition(&task, &bundle).await {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!(executor = %bundle.executor, error = %e, "Sampler run failed; marking its walkers as failed");
                failed_results(&bundle)
            }
        }
    })
}

fn failed_results(bundle: &Bundle) -> Result<Vec<WalkerResult>, TaskError> {
    (0..bundle.nwalkers())
        .map(|i| {
            let trajectory = match &bundle.trajectories {
                Some(paths) => {
                    write_geometries(&paths[i], &[])?;
                    Some(paths[i].clone())
                }
                None => None,
            };
            Ok(WalkerResult {
                status: RunStatus::Failed,
                state: Geometry::null(),
                time: 0.0,
                trajectory,
            })
        })
        .collect()
}

async fn run_partition(ctx: &ExecutionContext, bundle: &Bundle) -> Result<Vec<WalkerResult>, TaskError> {
    let fail = |e: &dyn std::fmt::Display| TaskError::new("sampling", e);
    let states = Deferred::gather(&bundle.states).resolve().await?;
    let dir = ctx.new_file("sampling_", "");
    tokio::fs::create_dir_all(&dir).await.map_err(|e| fail(&e))?;

    let mut invocation = ctx
        .invocation(&bundle.executor)
        .map_err(|e| fail(&e))?
        .arg("run")
        .arg("--input")
        .arg(INPUT_FILE);
    let mut entries = Vec::with_capacity(bundle.components.len());
    for (name, component) in bundle.names.iter().zip(&bundle.components) {
        let entry = component.serialize_component(&dir, name).await?;
        invocation = invocation.input(InputFile::copy(&entry.file, dir.join(&entry.file)));
        entries.push(entry);
    }
    for (i, state) in states.iter().enumerate() {
        let name = format!("start_{i}.xyz");
        write_geometries(&dir.join(&name), std::slice::from_ref(state))?;
        invocation = invocation.input(InputFile::copy(&name, dir.join(&name)));
    }
    let input = SamplerInput {
        components: entries,
        ..bundle.input.clone()
    };
    let input = toml::to_string(&input).map_err(|e| fail(&e))?;
    let invocation = invocation
        .input(InputFile::contents(INPUT_FILE, input))
        .input(InputFile::contents(WEIGHTS_FILE, bundle.weights.clone()));

    let outcome = ctx
        .run_process(&bundle.executor, invocation)
        .await
        .map_err(|e| fail(&e))?;
    let statuses = match outcome.exit {
        ExitKind::Success => read_status(&outcome.output(STATUS_FILE))?,
        ExitKind::TimedOut => HashMap::new(),
        ExitKind::Failed(code) => {
            return Err(fail(&format!(
                "sampler exited with code {code:?}; see {}",
                outcome.stderr.display()
            )));
        }
    };

    let mut results = Vec::with_capacity(bundle.nwalkers());
    for i in 0..bundle.nwalkers() {
        let path = outcome.output(&format!("walker_{i}.xyz"));
        let frames = if path.exists() { read_geometries(&path)? } else { Vec::new() };
        let (status, time) = match (outcome.exit, statuses.get(&i)) {
            (ExitKind::TimedOut, _) if !frames.is_empty() => {
                let stored = bundle.input.start + bundle.input.step * (frames.len() as u64 - 1);
                (RunStatus::Timeout, stored as f64 * bundle.timestep / 1000.0)
            }
            (ExitKind::Success, Some(&(status, time))) if !frames.is_empty() => (status, time),
            _ => (RunStatus::Failed, 0.0),
        };
        let state = frames.last().cloned().unwrap_or_else(Geometry::null);
        let trajectory = match &bundle.trajectories {
            Some(paths) => {
                write_geometries(&paths[i], &frames)?;
                Some(paths[i].clone())
            }
            None => None,
        };
        if status == RunStatus::ForceExceeded {
            warn!(walker = i, "Walker exceeded the force threshold");
        }
        results.push(WalkerResult {
            status,
            state,
            time,
            trajectory,
        });
    }
    Ok(results)
}

fn read_status(path: &Path) -> Result<HashMap<usize, (RunStatus, f64)>, TaskError> {
    let fail = |e: &dyn std::fmt::Display| TaskError::new("sampling.status", format!("{}: {e}", path.display()));
    let mut reader = csv::Reader::from_path(path).map_err(|e| fail(&e))?;
    let mut statuses = HashMap::new();
    for record in reader.deserialize::<StatusRecord>() {
        let record = record.map_err(|e| fail(&e))?;
        let status = RunStatus::from_code(record.status)
            .ok_or_else(|| fail(&format!("unknown status code {}", record.status)))?;
        statuses.insert(record.walker, (status, record.time));
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::traits::GeometryFile;
    use crate::core::io::xyz::XyzFile;
    use crate::core::potentials::einstein::EinsteinCrystal;
    use crate::core::potentials::plumed::PlumedBias;
    use crate::engine::config::SamplingConfigBuilder;
    use crate::engine::process::Invocation;
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use crate::engine::walker::{WalkerBuilder, replica_exchange};
    use nalgebra::{Matrix3, Vector3};

    #[test]
    fn status_counts_tally_and_accumulate() {
        let mut counts = StatusCounts::tally(&[RunStatus::Success, RunStatus::Failed, RunStatus::Success]);
        assert_eq!((counts.success, counts.failed, counts.total()), (2, 1, 3));
        counts += StatusCounts::tally(&[RunStatus::Timeout, RunStatus::ForceExceeded]);
        assert_eq!(counts.total(), 5);
        assert_eq!(
            counts.to_string(),
            "2 succeeded, 1 timed out, 1 exceeded the force limit, 1 failed"
        );
    }

    fn geometry(x: f64) -> Geometry {
        Geometry::from_data(
            &[6, 6],
            &[Vector3::new(x, 0.0, 0.0), Vector3::new(1.5, 0.0, 0.0)],
            Some(Matrix3::identity() * 10.0),
        )
        .unwrap()
    }

    fn einstein() -> Hamiltonian {
        Hamiltonian::EinsteinCrystal(EinsteinCrystal::new(geometry(0.0), 1.0))
    }

    fn plumed() -> Hamiltonian {
        let input = "UNITS LENGTH=A ENERGY=eV\nd: DISTANCE ATOMS=1,2\nRESTRAINT ARG=d AT=1.5 KAPPA=1.0\n";
        Hamiltonian::PlumedBias(PlumedBias::new(input).unwrap())
    }

    fn config(keep_trajectory: bool) -> SamplingConfig {
        SamplingConfigBuilder::new()
            .steps(100)
            .step(50)
            .keep_trajectory(keep_trajectory)
            .build()
            .unwrap()
    }

    /// Writes two frames per walker, each shifting the first atom by `shift`.
    fn propagate(
        shift: f64,
        exit: ExitKind,
    ) -> impl Fn(&Invocation, &Path) -> std::io::Result<ExitKind> + Send + Sync + 'static {
        move |_, dir| {
            let mut status = String::from("walker,status,time\n");
            let mut i = 0;
            while dir.join(format!("start_{i}.xyz")).exists() {
                let start = XyzFile::read_from_path(dir.join(format!("start_{i}.xyz")))
                    .map_err(std::io::Error::other)?;
                let frames: Vec<Geometry> = (1..=2)
                    .map(|k| {
                        let mut g = start[0].clone();
                        g.atoms_mut()[0].position.x += shift * k as f64;
                        g
                    })
                    .collect();
                XyzFile::write_to_path(&frames, dir.join(format!("walker_{i}.xyz")))
                    .map_err(std::io::Error::other)?;
                status.push_str(&format!("{i},0,0.05\n"));
                i += 1;
            }
            if exit == ExitKind::Success {
                std::fs::write(dir.join(STATUS_FILE), status)?;
            }
            Ok(exit)
        }
    }

    #[test]
    fn template_lists_ensemble_columns_then_sorted_components() {
        let a = Walker::new(geometry(0.0), einstein()).unwrap();
        let b = Walker::new(geometry(0.0), 0.5 * einstein() + plumed()).unwrap();
        let t = template(&[a, b]).unwrap();
        assert_eq!(t.header, vec!["TEMP", "EinsteinCrystal0", "PlumedBias0"]);
        assert_eq!(t.rows, vec![vec![300.0, 1.0, 0.0], vec![300.0, 0.5, 1.0]]);
        assert_eq!(t.to_csv().unwrap().lines().next(), Some("TEMP,EinsteinCrystal0,PlumedBias0"));

        let npt = WalkerBuilder::new()
            .start(geometry(0.0))
            .hamiltonian(einstein())
            .pressure(0.1)
            .build()
            .unwrap();
        assert_eq!(template(&[npt]).unwrap().header, vec!["TEMP", "PRESSURE", "EinsteinCrystal0"]);
    }

    #[test]
    fn template_rejects_dissimilar_walkers() {
        let a = Walker::new(geometry(0.0), einstein()).unwrap();
        let b = WalkerBuilder::new()
            .start(geometry(0.0))
            .hamiltonian(einstein())
            .timestep(1.0)
            .build()
            .unwrap();
        assert!(matches!(template(&[a, b]), Err(EngineError::InvalidWalker(_))));
        assert!(template(&[]).is_err());
    }

    #[test]
    fn motion_settings_follow_the_ensemble() {
        let nve = WalkerBuilder::new()
            .start(geometry(0.0))
            .hamiltonian(einstein())
            .without_temperature()
            .build()
            .unwrap();
        let settings = MotionSettings::for_walker(&nve);
        assert_eq!(settings.mode, Ensemble::Nve);
        assert!(settings.thermostat.is_none());

        let pimd_npt = WalkerBuilder::new()
            .start(geometry(0.0))
            .hamiltonian(einstein())
            .nbeads(8)
            .pressure(0.1)
            .build()
            .unwrap();
        let settings = MotionSettings::for_walker(&pimd_npt);
        assert_eq!(settings.mode, Ensemble::Npt);
        assert_eq!(settings.thermostat.unwrap().mode, ThermostatMode::PileG);
        let barostat = settings.barostat.unwrap();
        assert_eq!(barostat.tau, 200.0);
        assert_eq!(barostat.thermostat.mode, ThermostatMode::Langevin);
    }

    #[tokio::test]
    async fn successful_run_moves_walkers_to_their_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new().on("sampler", propagate(0.1, ExitKind::Success));
        let ctx = test_context(dir.path(), launcher.clone());
        let mut walkers = Walker::new(geometry(0.0), einstein()).unwrap().multiply(2).unwrap();
        let outputs = sample(&ctx, &mut walkers, &config(true)).unwrap();

        assert_eq!(outputs[0].status.resolve().await, Ok(RunStatus::Success));
        assert_eq!(outputs[1].time.resolve().await, Ok(0.05));
        assert_eq!(walkers[0].state().resolve().await.unwrap(), geometry(0.2));
        assert_eq!(walkers[1].is_reset().resolve().await, Ok(false));
        let trajectory = outputs[0].trajectory.as_ref().unwrap();
        assert_eq!(trajectory.length().resolve().await, Ok(2));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn failed_partition_only_affects_its_own_walkers() {
        let dir = tempfile::tempdir().unwrap();
        // Only the run with two walkers succeeds.
        let launcher = ScriptedLauncher::new().on("sampler", |invocation, dir| {
            if dir.join("start_1.xyz").exists() {
                propagate(0.1, ExitKind::Success)(invocation, dir)
            } else {
                Ok(ExitKind::Failed(Some(1)))
            }
        });
        let ctx = test_context(dir.path(), launcher.clone());
        let mut walkers = Walker::new(geometry(0.0), einstein()).unwrap().multiply(2).unwrap();
        walkers.push(
            WalkerBuilder::new()
                .start(geometry(0.3))
                .hamiltonian(einstein())
                .timestep(1.0)
                .build()
                .unwrap(),
        );
        let outputs = sample(&ctx, &mut walkers, &config(false)).unwrap();

        assert_eq!(outputs[0].status.resolve().await, Ok(RunStatus::Success));
        assert_eq!(outputs[1].status.resolve().await, Ok(RunStatus::Success));
        assert_eq!(outputs[2].status.resolve().await, Ok(RunStatus::Failed));
        assert!(outputs[2].state.resolve().await.unwrap().is_null());
        assert_eq!(walkers[2].state().resolve().await.unwrap(), geometry(0.3));
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn timed_out_run_keeps_the_last_stored_frame() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new().on("sampler", propagate(0.5, ExitKind::TimedOut));
        let ctx = test_context(dir.path(), launcher);
        let mut walkers = vec![Walker::new(geometry(0.0), einstein()).unwrap()];
        let outputs = sample(&ctx, &mut walkers, &config(false)).unwrap();

        assert_eq!(outputs[0].status.resolve().await, Ok(RunStatus::Timeout));
        assert_eq!(walkers[0].state().resolve().await.unwrap(), geometry(1.0));
        let time = outputs[0].time.resolve().await.unwrap();
        assert!((time - 0.025).abs() < 1e-12);
    }

    #[tokio::test]
    async fn success_without_frames_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new().on("sampler", |_, dir| {
            std::fs::write(dir.join(STATUS_FILE), "walker,status,time\n0,0,0.05\n")?;
            Ok(ExitKind::Success)
        });
        let ctx = test_context(dir.path(), launcher);
        let mut walkers = vec![Walker::new(geometry(0.4), einstein()).unwrap()];
        let outputs = sample(&ctx, &mut walkers, &config(false)).unwrap();

        assert_eq!(outputs[0].status.resolve().await, Ok(RunStatus::Failed));
        let state = walkers[0].state().resolve().await.unwrap();
        assert!(!state.is_null());
        assert_eq!(state, geometry(0.4));
        assert_eq!(walkers[0].is_reset().resolve().await, Ok(true));
    }

    #[tokio::test]
    async fn restarted_context_never_reads_frames_of_an_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new().on("sampler", propagate(5.0, ExitKind::Success));
        let ctx = test_context(dir.path(), launcher);
        let mut walkers = vec![Walker::new(geometry(0.0), einstein()).unwrap()];
        sample(&ctx, &mut walkers, &config(false)).unwrap();
        sample(&ctx, &mut walkers, &config(false)).unwrap();
        assert_eq!(walkers[0].state().resolve().await.unwrap(), geometry(20.0));

        let launcher = ScriptedLauncher::new().on("sampler", |_, _| Ok(ExitKind::TimedOut));
        let ctx = test_context(dir.path(), launcher);
        let mut walkers = vec![Walker::new(geometry(0.0), einstein()).unwrap()];
        let outputs = sample(&ctx, &mut walkers, &config(false)).unwrap();
        assert_eq!(outputs[0].status.resolve().await, Ok(RunStatus::Failed));
        assert_eq!(walkers[0].state().resolve().await.unwrap(), geometry(0.0));
    }

    #[tokio::test]
    async fn sampler_input_describes_coupling_and_components() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new().on("sampler", |invocation, dir| {
            let input = std::fs::read_to_string(dir.join(INPUT_FILE))?;
            assert!(input.contains("trial_frequency = 10"));
            assert!(input.contains("nwalkers = 2"));
            assert!(dir.join("EinsteinCrystal0.xyz").exists());
            assert!(dir.join("PlumedBias0.dat").exists());
            let weights = std::fs::read_to_string(dir.join(WEIGHTS_FILE))?;
            assert_eq!(weights.lines().count(), 3);
            propagate(0.0, ExitKind::Success)(invocation, dir)
        });
        let ctx = test_context(dir.path(), launcher);
        let mut walkers = Walker::new(geometry(0.0), einstein() + plumed())
            .unwrap()
            .multiply(2)
            .unwrap();
        replica_exchange(&ctx, &mut walkers, 10, true).unwrap();
        let outputs = sample(&ctx, &mut walkers, &config(false)).unwrap();
        assert_eq!(outputs[1].status.resolve().await, Ok(RunStatus::Success));
    }

    #[tokio::test]
    async fn unknown_sampler_executor_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let mut walkers = vec![Walker::new(geometry(0.0), einstein()).unwrap()];
        let config = SamplingConfigBuilder::new().steps(10).executor("gpu").build().unwrap();
        assert!(matches!(
            sample(&ctx, &mut walkers, &config),
            Err(EngineError::Process { .. })
        ));
    }
}
