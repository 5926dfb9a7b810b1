use crate::core::metrics::{self, ErrorQuery, Metric, Property};
use crate::core::models::geometry::Geometry;
use crate::engine::checkpoint::{self, Snapshot};
use crate::engine::config::LearningConfig;
use crate::engine::context::ExecutionContext;
use crate::engine::dataset::{Dataset, write_geometries};
use crate::engine::deferred::Deferred;
use crate::engine::error::{EngineError, TaskError};
use crate::engine::hamiltonian::Hamiltonian;
use crate::engine::model::Model;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::reference::Reference;
use crate::engine::sampling::{self, SimulationOutput, StatusCounts};
use crate::engine::walker::Walker;
use futures_util::future;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

pub const PARAMETERS_FILE: &str = "learning.toml";

/// The sample, label, retrain loop, persisted under a single output directory.
///
/// Iteration `i` writes its checkpoint to `<output>/<i>/`; a later call to
/// [`SequentialLearning::run`] on the same directory continues after the last
/// complete checkpoint.
#[derive(Debug, Clone)]
pub struct SequentialLearning {
    output: PathBuf,
    config: LearningConfig,
}

#[derive(Debug, Clone)]
pub struct LearningOutcome {
    /// Every geometry successfully labeled during this call, seed data included.
    pub data: Dataset,
    pub train: Dataset,
    pub valid: Dataset,
    /// Next free geometry identifier.
    pub identifier: Deferred<u64>,
}

struct LoopState {
    data: Dataset,
    train: Dataset,
    valid: Dataset,
    identifier: Deferred<u64>,
}

impl LoopState {
    fn into_outcome(self) -> LearningOutcome {
        LearningOutcome {
            data: self.data,
            train: self.train,
            valid: self.valid,
            identifier: self.identifier,
        }
    }
}

impl SequentialLearning {
    /// Creates `output` and records the parameters in `learning.toml`.
    pub fn new(output: impl Into<PathBuf>, config: LearningConfig) -> Result<Self, EngineError> {
        let output = output.into();
        std::fs::create_dir_all(&output).map_err(|e| EngineError::io(&output, e))?;
        let path = output.join(PARAMETERS_FILE);
        let text = toml::to_string(&config).map_err(|e| EngineError::Template {
            format: "toml",
            message: e.to_string(),
        })?;
        std::fs::write(&path, text).map_err(|e| EngineError::io(&path, e))?;
        Ok(Self { output, config })
    }

    /// Reads the parameters recorded by [`SequentialLearning::new`].
    pub fn load(output: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let output = output.into();
        let path = output.join(PARAMETERS_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        let config = toml::from_str(&text).map_err(|e| EngineError::Toml {
            path,
            message: e.to_string(),
        })?;
        Ok(Self { output, config })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Runs the remaining iterations.
    ///
    /// Without a checkpoint the model is seeded from `initial_data`, or from
    /// labeled random perturbations of the walker starts when none is given.
    /// With a checkpoint, model, datasets and walkers are restored from it and
    /// `initial_data` is ignored.
    #[instrument(skip_all, name = "learning_workflow")]
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        model: &mut Model,
        reference: &Reference,
        walkers: &mut [Walker],
        initial_data: Option<&Dataset>,
        reporter: &ProgressReporter<'_>,
    ) -> Result<LearningOutcome, EngineError> {
        if walkers.is_empty() {
            return Err(EngineError::InvalidWalker(
                "sequential learning needs at least one walker".into(),
            ));
        }
        let niterations = self.config.niterations;

        // === Phase 0: Resume or Initialize ===
        reporter.report(Progress::PhaseStart {
            name: "Initialization",
        });
        let (first, mut state) = match checkpoint::latest(&self.output)? {
            Some(marker) => {
                let restored = checkpoint::restore(ctx, &self.output, marker.iteration, walkers)?;
                *model = restored.model;
                info!(iteration = marker.iteration, "Resuming after checkpoint");
                let state = LoopState {
                    data: Dataset::new(ctx, Vec::new()),
                    train: restored.train,
                    valid: restored.valid,
                    identifier: Deferred::ready(marker.identifier),
                };
                (marker.iteration + 1, state)
            }
            None => {
                let state = self
                    .initialize(ctx, model, reference, walkers, initial_data)
                    .await?;
                (0, state)
            }
        };
        reporter.report(Progress::PhaseFinish);

        if first >= niterations {
            info!(niterations, "All iterations already completed");
            return Ok(state.into_outcome());
        }

        // === Phase 1: Sample, Label, Retrain ===
        reporter.report(Progress::PhaseStart { name: "Learning" });
        reporter.report(Progress::TaskStart {
            total_steps: (niterations - first) as u64,
        });
        let mut pending: Option<Submitted> = None;
        for iteration in first..niterations {
            reporter.report(Progress::IterationStart {
                index: iteration,
                total: niterations,
            });
            let counts = self.iterate(ctx, iteration, model, reference, walkers, &mut state)?;

            if let Some(previous) = pending.take() {
                self.settle(previous, reporter).await?;
            }
            let written = checkpoint::write(
                ctx,
                &self.output,
                Snapshot {
                    iteration,
                    model: &*model,
                    walkers: &*walkers,
                    train: &state.train,
                    valid: &state.valid,
                    identifier: &state.identifier,
                },
            )?;
            pending = Some(Submitted {
                iteration,
                counts,
                written,
            });
            reporter.report(Progress::TaskIncrement);
        }

        // === Phase 2: Finalize ===
        if let Some(last) = pending {
            self.settle(last, reporter).await?;
        }
        reporter.report(Progress::TaskFinish);
        reporter.report(Progress::PhaseFinish);
        info!(niterations, output = %self.output.display(), "Sequential learning finished");
        Ok(state.into_outcome())
    }

    /// Waits for the checkpoint of a submitted iteration and reports its walkers.
    async fn settle(&self, submitted: Submitted, reporter: &ProgressReporter<'_>) -> Result<(), EngineError> {
        let index = submitted.iteration;
        submitted.written.resolve().await?;
        match submitted.counts.resolve().await {
            Ok(counts) => {
                info!(iteration = index, %counts, "Walkers sampled");
                reporter.report(Progress::WalkersSampled { index, counts });
            }
            Err(e) => warn!(iteration = index, error = %e, "Walker statuses unavailable"),
        }
        reporter.report(Progress::CheckpointWritten {
            index,
            dir: checkpoint::iteration_dir(&self.output, index),
        });
        Ok(())
    }

    async fn initialize(
        &self,
        ctx: &ExecutionContext,
        model: &mut Model,
        reference: &Reference,
        walkers: &[Walker],
        initial_data: Option<&Dataset>,
    ) -> Result<LoopState, EngineError> {
        let (source, seed) = match initial_data {
            Some(data) => {
                info!("Seeding from supplied data");
                (data.clone(), data.clone())
            }
            None => {
                let unlabeled = perturbed_starts(
                    ctx,
                    walkers,
                    self.config.pretraining_nstates,
                    self.config.pretraining_amplitude,
                );
                info!(
                    nstates = self.config.pretraining_nstates,
                    amplitude = self.config.pretraining_amplitude,
                    "Labeling perturbed walker starts for pretraining"
                );
                let labeled = reference.evaluate_dataset(&unlabeled);
                (unlabeled, labeled)
            }
        };

        if model.is_initialized() {
            debug!("Model is already initialized; keeping its energy target");
        } else {
            if self.config.use_formation_energy {
                model.set_use_formation_energy(true)?;
            }
            if model.use_formation_energy() || self.config.atomic_energies_box_size.is_some() {
                self.add_atomic_energies(ctx, model, reference, walkers, &source)
                    .await?;
            }
        }

        let start = seed.geometries().map(|geometries| {
            geometries
                .iter()
                .filter_map(|g| g.identifier)
                .max()
                .map_or(0, |max| max + 1)
        });
        let (seed, identifier) = seed.assign_identifiers(&start);
        let labeled = seed.success();
        let (train, valid) = split_labeled(&labeled, self.config.train_valid_split);
        if !model.is_initialized() {
            model.initialize(&train)?;
        }
        Ok(LoopState {
            data: labeled,
            train,
            valid,
            identifier,
        })
    }

    /// Computes the isolated-atom energy of every element the model has no value for.
    async fn add_atomic_energies(
        &self,
        ctx: &ExecutionContext,
        model: &mut Model,
        reference: &Reference,
        walkers: &[Walker],
        source: &Dataset,
    ) -> Result<(), EngineError> {
        let mut elements: BTreeSet<String> = source.elements().resolve().await?;
        for walker in walkers {
            let start = walker.start().resolve().await?;
            elements.extend(start.elements().into_iter().map(str::to_string));
        }
        let missing: Vec<String> = elements
            .into_iter()
            .filter(|element| !model.atomic_energies().contains_key(element))
            .collect();
        let box_size = self.config.atomic_energies_box_size;
        let energies = future::try_join_all(
            missing
                .iter()
                .map(|element| reference.compute_atomic_energy(ctx, element, box_size)),
        )
        .await?;
        for (element, energy) in missing.iter().zip(energies) {
            info!(element = %element, energy, "Atomic reference energy");
            model.add_atomic_energy(element, energy)?;
        }
        Ok(())
    }

    /// Builds the graph of one iteration; nothing here waits for results.
    ///
    /// Returns the walker status tally of its sampling round.
    fn iterate(
        &self,
        ctx: &ExecutionContext,
        iteration: usize,
        model: &mut Model,
        reference: &Reference,
        walkers: &mut [Walker],
        state: &mut LoopState,
    ) -> Result<Deferred<StatusCounts>, EngineError> {
        let current = model.hamiltonian()?;
        for walker in walkers.iter_mut() {
            walker.hamiltonian = with_model(&walker.hamiltonian, &current);
        }

        let outputs = sampling::sample(ctx, walkers, &self.config.sampling)?;
        let statuses: Vec<_> = outputs.iter().map(|output| output.status.clone()).collect();
        let counts = Deferred::gather(&statuses).map(|statuses| StatusCounts::tally(&statuses));
        let labeled: Vec<Deferred<Geometry>> = outputs
            .iter()
            .map(|output| reference.evaluate(ctx, &sampled_state(output)))
            .collect();
        let (new, identifier) = Dataset::from_states(ctx, &labeled).assign_identifiers(&state.identifier);
        state.identifier = identifier;

        let conditions = reset_conditions(
            ctx,
            &new,
            &current.evaluate(&new),
            reference.properties().to_vec(),
            self.config.error_thresholds_for_reset,
            iteration,
        );

        let success = new.success();
        let (train, valid) = split_labeled(&success, self.config.train_valid_split);
        state.train.append(&train);
        state.valid.append(&valid);
        state.data.append(&success);

        if self.config.train_from_scratch {
            model.reset();
            model.initialize(&state.train)?;
        }
        model.train(&state.train, &state.valid)?;

        for (index, walker) in walkers.iter_mut().enumerate() {
            let condition = conditions.try_map(move |conditions| {
                conditions.get(index).copied().ok_or_else(|| {
                    TaskError::new("learning.reset_conditions", format!("no condition for walker {index}"))
                })
            });
            self.config.reset_policy.apply(walker, &condition);
        }
        info!(iteration, walkers = walkers.len(), "Submitted learning iteration");
        Ok(counts)
    }
}

/// An iteration whose checkpoint may still be in flight.
struct Submitted {
    iteration: usize,
    counts: Deferred<StatusCounts>,
    written: Deferred<()>,
}

/// Replaces any learned component of `hamiltonian` with `model`, keeping biases.
fn with_model(hamiltonian: &Hamiltonian, model: &Hamiltonian) -> Hamiltonian {
    let bias: Hamiltonian = hamiltonian
        .terms()
        .into_iter()
        .filter(|(component, _)| !matches!(component, Hamiltonian::Learned(_)))
        .map(|(component, coefficient)| coefficient * component)
        .sum();
    bias + model.clone()
}

/// The final state of a run worth labeling; null for failed runs.
fn sampled_state(output: &SimulationOutput) -> Deferred<Geometry> {
    output.status.join(&output.state).map(|(status, state)| {
        if status.keeps_state() {
            state
        } else {
            Geometry::null()
        }
    })
}

/// Random split where a dataset of fewer than two geometries goes entirely to training.
fn split_labeled(data: &Dataset, train_fraction: f64) -> (Dataset, Dataset) {
    let indices = data.length().map(move |n| {
        let ntrain = if n < 2 || train_fraction >= 1.0 {
            n
        } else {
            ((n as f64 * train_fraction).floor() as usize).clamp(1, n - 1)
        };
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rand::thread_rng());
        let valid = order.split_off(ntrain);
        (order, valid)
    });
    let train = data.select(indices.map(|(train, _)| train));
    let valid = data.select(indices.map(|(_, valid)| valid));
    (train, valid)
}

/// Copies of the walker starts, cycled to `nstates`, with every coordinate
/// displaced uniformly within `±amplitude` Å.
fn perturbed_starts(ctx: &ExecutionContext, walkers: &[Walker], nstates: usize, amplitude: f64) -> Dataset {
    let starts: Vec<Deferred<Geometry>> = walkers.iter().map(|w| w.start().clone()).collect();
    let output = ctx.new_file("data_", ".xyz");
    let file = ctx.then_blocking("learning.pretraining", &Deferred::gather(&starts), move |starts| {
        let mut rng = rand::thread_rng();
        let perturbed: Vec<Geometry> = starts
            .iter()
            .cycle()
            .take(nstates)
            .map(|start| {
                let mut geometry = start.clone();
                geometry.reset();
                geometry.identifier = None;
                for atom in geometry.atoms_mut() {
                    for x in atom.position.iter_mut() {
                        *x += rng.gen_range(-amplitude..=amplitude);
                    }
                }
                geometry
            })
            .collect();
        write_geometries(&output, &perturbed)?;
        Ok(output)
    });
    Dataset::from_deferred(ctx, file)
}

/// Whether each walker should be reset: its label failed, or the model that
/// drove it erred beyond the energy (meV/atom) or force (meV/Å) threshold.
fn reset_conditions(
    ctx: &ExecutionContext,
    labeled: &Dataset,
    predicted: &Dataset,
    properties: Vec<Property>,
    thresholds: (f64, f64),
    iteration: usize,
) -> Deferred<Vec<bool>> {
    let inputs = labeled.geometries().join(&predicted.geometries());
    ctx.then_blocking("learning.reset_conditions", &inputs, move |(labeled, predicted)| {
        let query = ErrorQuery::new(Metric::Rmse, properties);
        labeled
            .iter()
            .zip(&predicted)
            .enumerate()
            .map(|(walker, (reference, model))| {
                if reference.is_null() || reference.energy.is_none() {
                    warn!(iteration, walker, "Labeling failed; walker will be reset");
                    return Ok(true);
                }
                let errors = metrics::compute_errors(
                    std::slice::from_ref(reference),
                    Some(std::slice::from_ref(model)),
                    &query,
                )
                .map_err(|e| TaskError::new("learning.reset_conditions", e))?;
                let energy = errors[(0, 0)];
                let forces = (errors.ncols() > 1).then(|| errors[(0, 1)]);
                let breach = energy > thresholds.0 || forces.is_some_and(|f| f > thresholds.1);
                if breach {
                    info!(
                        iteration,
                        walker,
                        energy_error = energy,
                        force_error = ?forces,
                        "Model error above threshold; walker will be reset"
                    );
                }
                Ok(breach)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::traits::GeometryFile;
    use crate::core::io::xyz::XyzFile;
    use crate::engine::config::{LearningConfigBuilder, SamplingConfigBuilder};
    use crate::engine::model::MODEL_FILE;
    use crate::engine::process::{ExitKind, InputFile, Invocation};
    use crate::engine::reference::ReferenceBackend;
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use crate::engine::walker::ResetPolicy;
    use nalgebra::{Matrix3, Vector3};
    use std::sync::{Arc, Mutex};

    fn h2(dx: f64) -> Geometry {
        Geometry::from_data(
            &[1, 1],
            &[Vector3::zeros(), Vector3::new(0.74 + dx, 0.0, 0.0)],
            Some(Matrix3::identity() * 6.0),
        )
        .unwrap()
    }

    fn label(mut geometry: Geometry, energy_per_atom: f64) -> Geometry {
        geometry.energy = Some(energy_per_atom * geometry.natoms() as f64);
        for atom in geometry.atoms_mut() {
            atom.force = Vector3::zeros();
        }
        geometry
    }

    /// Every atom contributes -1 eV and feels no force.
    #[derive(Debug)]
    struct Uniform;

    impl ReferenceBackend for Uniform {
        fn name(&self) -> &'static str {
            "uniform"
        }

        fn prepare(&self, _: &Geometry, _: &[Property]) -> Result<Vec<InputFile>, EngineError> {
            Ok(Vec::new())
        }

        fn arguments(&self) -> Vec<String> {
            Vec::new()
        }

        fn parse(&self, _: &str, _: &[Property], geometry: &Geometry) -> Option<Geometry> {
            Some(label(geometry.clone(), -1.0))
        }

        fn single_atom_variants(
            &self,
            _: u8,
        ) -> Result<Vec<(String, Arc<dyn ReferenceBackend>)>, EngineError> {
            Ok(vec![("default".into(), Arc::new(Uniform))])
        }
    }

    fn reference() -> Reference {
        Reference::new(
            Arc::new(Uniform),
            vec![Property::Energy, Property::Forces],
            "reference",
        )
        .unwrap()
    }

    /// Trains trivially and predicts `energy_per_atom` for every atom.
    fn trainer(
        energy_per_atom: f64,
    ) -> impl Fn(&Invocation, &Path) -> std::io::Result<ExitKind> + Send + Sync + 'static {
        move |invocation, dir| {
            if invocation.extra_args[0] == "evaluate" {
                let data = XyzFile::read_from_path(dir.join("data.xyz")).map_err(std::io::Error::other)?;
                let predicted: Vec<Geometry> = data.into_iter().map(|g| label(g, energy_per_atom)).collect();
                XyzFile::write_to_path(&predicted, dir.join("evaluated.xyz")).map_err(std::io::Error::other)?;
            } else {
                std::fs::write(dir.join(MODEL_FILE), "weights")?;
            }
            Ok(ExitKind::Success)
        }
    }

    /// Moves the second atom of every walker by 0.1 Å.
    fn sampler(_: &Invocation, dir: &Path) -> std::io::Result<ExitKind> {
        let mut status = String::from("walker,status,time\n");
        let mut i = 0;
        while dir.join(format!("start_{i}.xyz")).exists() {
            let mut start = XyzFile::read_from_path(dir.join(format!("start_{i}.xyz")))
                .map_err(std::io::Error::other)?;
            start[0].atoms_mut()[1].position.x += 0.1;
            XyzFile::write_to_path(&start[..1], dir.join(format!("walker_{i}.xyz")))
                .map_err(std::io::Error::other)?;
            status.push_str(&format!("{i},0,0.005\n"));
            i += 1;
        }
        std::fs::write(dir.join(sampling::STATUS_FILE), status)?;
        Ok(ExitKind::Success)
    }

    fn launcher(predicted_energy_per_atom: f64) -> ScriptedLauncher {
        ScriptedLauncher::new()
            .on("cp2k", |_, _| Ok(ExitKind::Success))
            .on("sampler", sampler)
            .on("trainer", trainer(predicted_energy_per_atom))
    }

    fn walkers() -> Vec<Walker> {
        (0..2)
            .map(|_| Walker::new(h2(0.0), Hamiltonian::zero()).unwrap())
            .collect()
    }

    fn config(niterations: usize) -> LearningConfigBuilder {
        LearningConfigBuilder::new()
            .niterations(niterations)
            .pretraining_nstates(3)
            .sampling(SamplingConfigBuilder::new().steps(10).build().unwrap())
    }

    #[tokio::test]
    async fn loop_accumulates_data_and_resumes_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir.path().join("context"), launcher(-1.0));
        let output = dir.path().join("output");
        let learning = SequentialLearning::new(&output, config(2).build().unwrap()).unwrap();
        let initial = Dataset::new(&ctx, (0..3).map(|i| label(h2(0.01 * i as f64), -1.0)).collect());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = ProgressReporter::with_callback(Box::new(move |e: Progress| sink.lock().unwrap().push(e)));
        let mut model = Model::new(&ctx, "mace", toml::Table::new());
        let mut walkers = walkers();
        let outcome = learning
            .run(&ctx, &mut model, &reference(), &mut walkers, Some(&initial), &reporter)
            .await
            .unwrap();

        assert_eq!(outcome.data.length().resolve().await, Ok(7));
        assert_eq!(outcome.identifier.resolve().await, Ok(7));
        let total = outcome.train.length().resolve().await.unwrap() + outcome.valid.length().resolve().await.unwrap();
        assert_eq!(total, 7);
        for walker in &walkers {
            assert_eq!(walker.is_reset().resolve().await, Ok(false));
        }
        let events = events.lock().unwrap().clone();
        let iterations = events
            .iter()
            .filter(|e| matches!(e, Progress::IterationStart { .. }))
            .count();
        assert_eq!(iterations, 2);
        let sampled: Vec<(usize, StatusCounts)> = events
            .iter()
            .filter_map(|e| match e {
                Progress::WalkersSampled { index, counts } => Some((*index, *counts)),
                _ => None,
            })
            .collect();
        let all_succeeded = StatusCounts {
            success: 2,
            ..StatusCounts::default()
        };
        assert_eq!(sampled, vec![(0, all_succeeded), (1, all_succeeded)]);
        let checkpoints: Vec<PathBuf> = events
            .iter()
            .filter_map(|e| match e {
                Progress::CheckpointWritten { dir, .. } => Some(dir.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            checkpoints,
            vec![checkpoint::iteration_dir(&output, 0), checkpoint::iteration_dir(&output, 1)]
        );

        let marker = checkpoint::latest(&output).unwrap().unwrap();
        assert_eq!((marker.iteration, marker.identifier, marker.nwalkers), (1, 7, 2));

        let resumed = SequentialLearning::load(&output).unwrap();
        assert_eq!(resumed.config(), learning.config());
        let mut model = Model::new(&ctx, "mace", toml::Table::new());
        let mut walkers = self::walkers();
        let outcome = resumed
            .run(&ctx, &mut model, &reference(), &mut walkers, None, &ProgressReporter::new())
            .await
            .unwrap();
        assert_eq!(outcome.data.length().resolve().await, Ok(0));
        assert!(model.is_initialized());
        assert_eq!(outcome.identifier.resolve().await, Ok(7));
        assert_eq!(walkers[0].is_reset().resolve().await, Ok(false));
    }

    #[tokio::test]
    async fn pretraining_labels_perturbed_starts_with_formation_energies() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir.path().join("context"), launcher(0.0));
        let config = config(1)
            .use_formation_energy(true)
            .atomic_energies_box_size(8.0)
            .build()
            .unwrap();
        let learning = SequentialLearning::new(dir.path().join("output"), config).unwrap();
        let mut model = Model::new(&ctx, "mace", toml::Table::new());
        let mut walkers = walkers();
        let outcome = learning
            .run(&ctx, &mut model, &reference(), &mut walkers, None, &ProgressReporter::new())
            .await
            .unwrap();

        assert_eq!(model.atomic_energies().get("H"), Some(&-1.0));
        assert!(model.use_formation_energy());
        let data = outcome.data.geometries().resolve().await.unwrap();
        assert_eq!(data.len(), 5);
        assert!(data.iter().all(|g| g.energy.is_some() && g.identifier.is_some()));
        assert_eq!(outcome.identifier.resolve().await, Ok(5));
        // Zero formation energies plus the atomic energies reproduce the reference.
        for walker in &walkers {
            assert_eq!(walker.is_reset().resolve().await, Ok(false));
        }
    }

    #[tokio::test]
    async fn inaccurate_model_resets_walkers_under_conditional_policy() {
        for (policy, expected) in [(ResetPolicy::Conditional, true), (ResetPolicy::Never, false)] {
            let dir = tempfile::tempdir().unwrap();
            let ctx = test_context(&dir.path().join("context"), launcher(0.0));
            let config = config(1).reset_policy(policy).build().unwrap();
            let learning = SequentialLearning::new(dir.path().join("output"), config).unwrap();
            let initial = Dataset::new(&ctx, vec![label(h2(0.0), -1.0), label(h2(0.02), -1.0)]);
            let mut model = Model::new(&ctx, "mace", toml::Table::new());
            let mut walkers = walkers();
            learning
                .run(&ctx, &mut model, &reference(), &mut walkers, Some(&initial), &ProgressReporter::new())
                .await
                .unwrap();
            for walker in &walkers {
                assert_eq!(walker.is_reset().resolve().await, Ok(expected), "{policy:?}");
            }
        }
    }

    #[tokio::test]
    async fn learning_requires_walkers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), launcher(-1.0));
        let learning = SequentialLearning::new(dir.path().join("output"), config(1).build().unwrap()).unwrap();
        let mut model = Model::new(&ctx, "mace", toml::Table::new());
        let result = learning
            .run(&ctx, &mut model, &reference(), &mut [], None, &ProgressReporter::new())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidWalker(_))));
    }

    #[test]
    fn learned_component_is_replaced_and_biases_are_kept() {
        let bias = Hamiltonian::EinsteinCrystal(crate::core::potentials::einstein::EinsteinCrystal::new(h2(0.0), 1.0));
        let old = Hamiltonian::Learned(crate::engine::hamiltonian::LearnedHamiltonian {
            model: Deferred::ready(PathBuf::from("old.model")),
            executor: "model".into(),
            atomic_energies: Default::default(),
        });
        let new = Hamiltonian::Learned(crate::engine::hamiltonian::LearnedHamiltonian {
            model: Deferred::ready(PathBuf::from("new.model")),
            executor: "model".into(),
            atomic_energies: Default::default(),
        });
        let combined = with_model(&(0.5 * bias.clone() + old), &new);
        assert_eq!(combined, 0.5 * bias + new);
    }
}
