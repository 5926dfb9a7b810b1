use super::config::ConfigError;
use super::context::ExecutionContext;
use super::dataset::Dataset;
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use super::hamiltonian::Hamiltonian;
use super::sampling::SimulationOutput;
use crate::core::models::geometry::Geometry;
use serde::{Deserialize, Serialize};

/// What to do with a walker after a learning iteration flagged it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    /// Reset only when the condition resolves to `true`.
    #[default]
    Conditional,
    Always,
    Never,
}

impl ResetPolicy {
    pub fn apply(self, walker: &mut Walker, condition: &Deferred<bool>) {
        match self {
            ResetPolicy::Conditional => walker.reset_if(condition),
            ResetPolicy::Always => walker.reset(),
            ResetPolicy::Never => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coupling {
    ReplicaExchange {
        trial_frequency: u64,
        rescale_kinetic: bool,
        group: u64,
    },
}

impl Coupling {
    pub fn group(&self) -> u64 {
        match self {
            Coupling::ReplicaExchange { group, .. } => *group,
        }
    }
}

/// One replica of MD/PIMD sampling: a start geometry, its live state, the
/// hamiltonian it moves on and the ensemble it samples.
#[derive(Debug, Clone)]
pub struct Walker {
    start: Deferred<Geometry>,
    state: Deferred<Geometry>,
    pub hamiltonian: Hamiltonian,
    temperature: Option<f64>,
    pressure: Option<f64>,
    nbeads: usize,
    timestep: f64,
    periodic: bool,
    coupling: Option<Coupling>,
}

#[derive(Default)]
pub struct WalkerBuilder {
    start: Option<Geometry>,
    hamiltonian: Option<Hamiltonian>,
    temperature: Option<Option<f64>>,
    pressure: Option<f64>,
    nbeads: Option<usize>,
    timestep: Option<f64>,
    periodic: Option<bool>,
}

impl WalkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, start: Geometry) -> Self {
        self.start = Some(start);
        self
    }
    pub fn hamiltonian(mut self, hamiltonian: Hamiltonian) -> Self {
        self.hamiltonian = Some(hamiltonian);
        self
    }
    pub fn temperature(mut self, kelvin: f64) -> Self {
        self.temperature = Some(Some(kelvin));
        self
    }
    /// Removes the thermostat (microcanonical sampling).
    pub fn without_temperature(mut self) -> Self {
        self.temperature = Some(None);
        self
    }
    pub fn pressure(mut self, megapascal: f64) -> Self {
        self.pressure = Some(megapascal);
        self
    }
    pub fn nbeads(mut self, nbeads: usize) -> Self {
        self.nbeads = Some(nbeads);
        self
    }
    pub fn timestep(mut self, femtoseconds: f64) -> Self {
        self.timestep = Some(femtoseconds);
        self
    }
    /// Declares the expected periodicity; it must agree with the start geometry.
    pub fn periodic(mut self, periodic: bool) -> Self {
        self.periodic = Some(periodic);
        self
    }

    pub fn build(self) -> Result<Walker, EngineError> {
        let start = self.start.ok_or(ConfigError::MissingParameter("start"))?;
        let hamiltonian = self
            .hamiltonian
            .ok_or(ConfigError::MissingParameter("hamiltonian"))?;
        if start.is_null() {
            return Err(EngineError::InvalidWalker("start geometry is null".into()));
        }
        let periodic = start.periodic();
        if let Some(declared) = self.periodic {
            if declared != periodic {
                return Err(EngineError::InvalidWalker(format!(
                    "declared periodic={declared} but start geometry has periodic={periodic}"
                )));
            }
        }
        let temperature = self.temperature.unwrap_or(Some(300.0));
        if self.pressure.is_some() && temperature.is_none() {
            return Err(EngineError::InvalidWalker(
                "a pressure requires a temperature".into(),
            ));
        }
        if self.pressure.is_some() && !periodic {
            return Err(EngineError::InvalidWalker(
                "constant-pressure sampling requires a periodic start geometry".into(),
            ));
        }
        if temperature.is_some_and(|t| t <= 0.0) {
            return Err(EngineError::InvalidWalker("temperature must be positive".into()));
        }
        let nbeads = self.nbeads.unwrap_or(1);
        if nbeads == 0 {
            return Err(EngineError::InvalidWalker("nbeads must be at least 1".into()));
        }
        let timestep = self.timestep.unwrap_or(0.5);
        if timestep <= 0.0 {
            return Err(EngineError::InvalidWalker("timestep must be positive".into()));
        }
        let start = Deferred::ready(start);
        Ok(Walker {
            state: start.clone(),
            start,
            hamiltonian,
            temperature,
            pressure: self.pressure,
            nbeads,
            timestep,
            periodic,
            coupling: None,
        })
    }
}

impl Walker {
    /// An NVT walker at 300 K with default settings.
    pub fn new(start: Geometry, hamiltonian: Hamiltonian) -> Result<Self, EngineError> {
        WalkerBuilder::new().start(start).hamiltonian(hamiltonian).build()
    }

    pub fn start(&self) -> &Deferred<Geometry> {
        &self.start
    }

    pub fn state(&self) -> &Deferred<Geometry> {
        &self.state
    }

    /// Replaces the start geometry; the state is left untouched.
    pub(crate) fn set_start(&mut self, start: Deferred<Geometry>) {
        self.start = start;
    }

    pub(crate) fn set_state(&mut self, state: Deferred<Geometry>) {
        self.state = state;
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn pressure(&self) -> Option<f64> {
        self.pressure
    }

    pub fn nbeads(&self) -> usize {
        self.nbeads
    }

    pub fn timestep(&self) -> f64 {
        self.timestep
    }

    pub fn periodic(&self) -> bool {
        self.periodic
    }

    pub fn coupling(&self) -> Option<&Coupling> {
        self.coupling.as_ref()
    }

    pub fn pimd(&self) -> bool {
        self.nbeads != 1
    }

    pub fn nve(&self) -> bool {
        self.temperature.is_none() && self.pressure.is_none()
    }

    pub fn nvt(&self) -> bool {
        self.temperature.is_some() && self.pressure.is_none()
    }

    pub fn npt(&self) -> bool {
        self.temperature.is_some() && self.pressure.is_some()
    }

    /// Whether both walkers can be propagated by one sampler run.
    pub fn is_similar(&self, other: &Walker) -> bool {
        self.temperature.is_some() == other.temperature.is_some()
            && self.pressure.is_some() == other.pressure.is_some()
            && self.pimd() == other.pimd()
            && self.coupling == other.coupling
            && self.periodic == other.periodic
            && self.timestep == other.timestep
    }

    /// Keeps the final state of a successful or timed-out run, otherwise returns to start.
    pub fn update(&mut self, output: &SimulationOutput) {
        self.state = output
            .status
            .join3(&output.state, &self.start)
            .map(|(status, state, start)| if status.keeps_state() { state } else { start });
    }

    pub fn reset(&mut self) {
        self.state = self.start.clone();
    }

    /// Resets once `condition` resolves, without waiting for it now.
    pub fn reset_if(&mut self, condition: &Deferred<bool>) {
        self.state = condition
            .join3(&self.start, &self.state)
            .map(|(reset, start, state)| if reset { start } else { state });
    }

    pub fn is_reset(&self) -> Deferred<bool> {
        self.start.join(&self.state).map(|(start, state)| start == state)
    }

    /// Independent copies sharing start, state and settings.
    pub fn multiply(&self, n: usize) -> Result<Vec<Walker>, EngineError> {
        if self.coupling.is_some() {
            return Err(EngineError::InvalidWalker(
                "cannot multiply walkers after they are coupled".into(),
            ));
        }
        Ok(vec![self.clone(); n])
    }
}

/// Couples walkers through replica exchange trials.
///
/// Each call opens a new coupling group numbered by `ctx`.
pub fn replica_exchange(
    ctx: &ExecutionContext,
    walkers: &mut [Walker],
    trial_frequency: u64,
    rescale_kinetic: bool,
) -> Result<(), EngineError> {
    if walkers.len() < 2 {
        return Err(EngineError::InvalidWalker(
            "replica exchange needs at least two walkers".into(),
        ));
    }
    if trial_frequency == 0 {
        return Err(ConfigError::InvalidParameter {
            name: "trial_frequency",
            reason: "must be positive".into(),
        }
        .into());
    }
    if walkers.iter().any(|w| w.coupling.is_some()) {
        return Err(EngineError::InvalidWalker("walker is already coupled".into()));
    }
    if walkers.iter().any(|w| !w.is_similar(&walkers[0])) {
        return Err(EngineError::InvalidWalker(
            "replica exchange requires walkers of the same ensemble type".into(),
        ));
    }
    let group = ctx.next_coupling_group();
    for walker in walkers.iter_mut() {
        walker.coupling = Some(Coupling::ReplicaExchange {
            trial_frequency,
            rescale_kinetic,
            group,
        });
    }
    Ok(())
}

/// Groups walker indices by [`Walker::is_similar`], in order of first appearance.
pub fn partition(walkers: &[Walker]) -> Vec<Vec<usize>> {
    let mut partitions: Vec<Vec<usize>> = Vec::new();
    for (index, walker) in walkers.iter().enumerate() {
        match partitions
            .iter_mut()
            .find(|p| walker.is_similar(&walkers[p[0]]))
        {
            Some(partition) => partition.push(index),
            None => partitions.push(vec![index]),
        }
    }
    partitions
}

fn minimum_energy_index(coefficients: &[f64], energies: &[Vec<Option<f64>>]) -> Result<usize, TaskError> {
    let nstates = energies.first().map_or(0, Vec::len);
    (0..nstates)
        .filter_map(|i| {
            coefficients
                .iter()
                .zip(energies)
                .map(|(c, e)| e[i].map(|e| c * e))
                .sum::<Option<f64>>()
                .map(|total| (i, total))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| TaskError::new("quench", "no geometry in the dataset could be evaluated"))
}

/// Restarts every walker from the dataset geometry with the lowest energy on
/// its own hamiltonian.
pub fn quench(walkers: &mut [Walker], dataset: &Dataset) {
    let union: Hamiltonian = walkers.iter().map(|w| w.hamiltonian.clone()).sum();
    let components = union.components();
    let energies: Vec<_> = components
        .iter()
        .map(|h| h.evaluate(dataset).energies())
        .collect();
    let energies = Deferred::gather(&energies);
    for walker in walkers.iter_mut() {
        let coefficients = walker.hamiltonian.get_coefficients(&components);
        let index = energies.try_map(move |e| {
            if e.is_empty() {
                return Ok(0);
            }
            minimum_energy_index(&coefficients, &e)
        });
        walker.start = dataset.get_at(&index);
        walker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::potentials::einstein::EinsteinCrystal;
    use crate::engine::sampling::RunStatus;
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use nalgebra::{Matrix3, Vector3};

    fn geometry(x: f64, periodic: bool) -> Geometry {
        Geometry::from_data(
            &[6],
            &[Vector3::new(x, 0.0, 0.0)],
            periodic.then(|| Matrix3::identity() * 10.0),
        )
        .unwrap()
    }

    fn einstein(x: f64) -> Hamiltonian {
        Hamiltonian::EinsteinCrystal(EinsteinCrystal::new(geometry(x, true), 1.0))
    }

    fn output(status: RunStatus, state: Geometry) -> SimulationOutput {
        SimulationOutput {
            status: Deferred::ready(status),
            state: Deferred::ready(state),
            time: Deferred::ready(0.0),
            trajectory: None,
        }
    }

    #[test]
    fn builder_validates_ensemble_and_periodicity() {
        let base = || WalkerBuilder::new().start(geometry(0.0, true)).hamiltonian(einstein(0.0));
        assert!(base().build().unwrap().nvt());
        assert!(base().periodic(false).build().is_err());
        assert!(base().timestep(0.0).build().is_err());
        assert!(base().nbeads(0).build().is_err());
        assert!(base().without_temperature().pressure(0.1).build().is_err());
        assert!(base().pressure(0.1).build().unwrap().npt());
        assert!(base().without_temperature().build().unwrap().nve());
        assert!(matches!(
            WalkerBuilder::new().start(geometry(0.0, true)).build(),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn walkers_with_scaled_hamiltonians_share_a_partition() {
        let h = einstein(0.0);
        let a = Walker::new(geometry(0.0, true), h.clone()).unwrap();
        let b = Walker::new(geometry(0.1, true), 0.5 * h).unwrap();
        let pimd = WalkerBuilder::new()
            .start(geometry(0.0, true))
            .hamiltonian(einstein(0.0))
            .nbeads(8)
            .build()
            .unwrap();
        let molecule = Walker::new(geometry(0.0, false), einstein(0.0)).unwrap();
        assert!(a.is_similar(&b));
        assert_eq!(partition(&[a, pimd, b, molecule]), vec![vec![0, 2], vec![1], vec![3]]);
    }

    #[test]
    fn partition_places_every_walker_exactly_once() {
        let walkers: Vec<Walker> = (0..7)
            .map(|i| {
                WalkerBuilder::new()
                    .start(geometry(0.0, true))
                    .hamiltonian(einstein(0.0))
                    .timestep(if i % 3 == 0 { 0.5 } else { 1.0 })
                    .build()
                    .unwrap()
            })
            .collect();
        let mut seen: Vec<usize> = partition(&walkers).into_iter().flatten().collect();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn coupled_walkers_cannot_be_multiplied() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let walker = Walker::new(geometry(0.0, true), einstein(0.0)).unwrap();
        let mut walkers = walker.multiply(3).unwrap();
        replica_exchange(&ctx, &mut walkers, 10, true).unwrap();
        assert!(walkers[0].multiply(2).is_err());
        assert_eq!(walkers[0].coupling(), walkers[2].coupling());
        assert!(!walkers[0].is_similar(&walker));
    }

    #[tokio::test]
    async fn coupling_groups_are_numbered_per_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let walker = Walker::new(geometry(0.0, true), einstein(0.0)).unwrap();
        let mut first = walker.multiply(2).unwrap();
        let mut second = walker.multiply(2).unwrap();
        replica_exchange(&ctx, &mut first, 10, false).unwrap();
        replica_exchange(&ctx, &mut second, 10, false).unwrap();
        assert_eq!(first[0].coupling().map(|c| c.group()), Some(0));
        assert_eq!(second[0].coupling().map(|c| c.group()), Some(1));
        assert!(!first[0].is_similar(&second[0]));

        let other = test_context(dir.path(), ScriptedLauncher::new());
        let mut third = walker.multiply(2).unwrap();
        replica_exchange(&other, &mut third, 10, false).unwrap();
        assert_eq!(third[0].coupling().map(|c| c.group()), Some(0));
    }

    #[tokio::test]
    async fn timeout_keeps_state_but_failure_reverts_to_start() {
        let mut walker = Walker::new(geometry(0.0, true), einstein(0.0)).unwrap();
        walker.update(&output(RunStatus::Timeout, geometry(1.0, true)));
        assert_eq!(walker.state().resolve().await.unwrap(), geometry(1.0, true));
        assert_eq!(walker.is_reset().resolve().await, Ok(false));

        walker.update(&output(RunStatus::ForceExceeded, geometry(2.0, true)));
        assert_eq!(walker.state().resolve().await.unwrap(), geometry(0.0, true));
        assert_eq!(walker.is_reset().resolve().await, Ok(true));
    }

    #[tokio::test]
    async fn conditional_reset_waits_for_its_condition() {
        let mut walker = Walker::new(geometry(0.0, true), einstein(0.0)).unwrap();
        walker.update(&output(RunStatus::Success, geometry(1.0, true)));
        walker.reset_if(&Deferred::ready(false));
        assert_eq!(walker.is_reset().resolve().await, Ok(false));
        ResetPolicy::Never.apply(&mut walker, &Deferred::ready(true));
        assert_eq!(walker.is_reset().resolve().await, Ok(false));
        ResetPolicy::Conditional.apply(&mut walker, &Deferred::ready(true));
        assert_eq!(walker.is_reset().resolve().await, Ok(true));
    }

    #[tokio::test]
    async fn quench_restarts_from_lowest_energy_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(
            &ctx,
            vec![geometry(0.0, true), geometry(1.0, true), geometry(2.0, true)],
        );
        let mut walkers = vec![
            Walker::new(geometry(5.0, true), einstein(2.0)).unwrap(),
            Walker::new(geometry(5.0, true), einstein(0.9)).unwrap(),
        ];
        quench(&mut walkers, &data);
        assert_eq!(walkers[0].start().resolve().await.unwrap(), geometry(2.0, true));
        assert_eq!(walkers[1].start().resolve().await.unwrap(), geometry(1.0, true));
        assert_eq!(walkers[1].is_reset().resolve().await, Ok(true));
    }
}
