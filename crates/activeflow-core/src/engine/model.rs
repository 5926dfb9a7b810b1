use super::context::ExecutionContext;
use super::dataset::{Dataset, read_geometries, write_geometries};
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use super::hamiltonian::{Hamiltonian, LearnedHamiltonian};
use super::process::InputFile;
use crate::core::models::element;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "model.toml";
pub const MODEL_FILE: &str = "model.out";

/// A trainable interatomic potential whose weights live in a file produced by
/// an external trainer.
///
/// The trainer is invoked as `<program> initialize|train --config config.toml
/// --train train.xyz [--valid valid.xyz] [--model previous.model] --output model.out`.
#[derive(Debug, Clone)]
pub struct Model {
    ctx: ExecutionContext,
    name: String,
    config: toml::Table,
    executor: String,
    atomic_energies: BTreeMap<String, f64>,
    use_formation_energy: bool,
    file: Option<Deferred<PathBuf>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    executor: String,
    use_formation_energy: bool,
    atomic_energies: BTreeMap<String, f64>,
    config: toml::Table,
}

impl Model {
    pub fn new(ctx: &ExecutionContext, name: impl Into<String>, config: toml::Table) -> Self {
        Self {
            ctx: ctx.clone(),
            name: name.into(),
            config,
            executor: "model".to_string(),
            atomic_energies: BTreeMap::new(),
            use_formation_energy: false,
            file: None,
        }
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &toml::Table {
        &self.config
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    pub fn atomic_energies(&self) -> &BTreeMap<String, f64> {
        &self.atomic_energies
    }

    pub fn use_formation_energy(&self) -> bool {
        self.use_formation_energy
    }

    pub fn file(&self) -> Option<&Deferred<PathBuf>> {
        self.file.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.file.is_some()
    }

    fn ensure_uninitialized(&self, action: &str) -> Result<(), EngineError> {
        if self.is_initialized() {
            return Err(EngineError::InvalidModel(format!(
                "cannot {action} after the model has been initialized"
            )));
        }
        Ok(())
    }

    pub fn add_atomic_energy(&mut self, element: &str, energy: f64) -> Result<(), EngineError> {
        self.ensure_uninitialized("change atomic energies")?;
        if element::atomic_number(element).is_none() {
            return Err(EngineError::InvalidModel(format!("unknown element '{element}'")));
        }
        self.atomic_energies.insert(element.to_string(), energy);
        Ok(())
    }

    /// Trains on formation energies instead of total energies.
    pub fn set_use_formation_energy(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.ensure_uninitialized("change the energy target")?;
        self.use_formation_energy = enabled;
        Ok(())
    }

    /// Configuration handed to the trainer.
    fn trainer_config(&self) -> Result<String, EngineError> {
        let mut config = self.config.clone();
        config.insert("name".into(), self.name.clone().into());
        config.insert("use_formation_energy".into(), self.use_formation_energy.into());
        let energies: toml::Table = self
            .atomic_energies
            .iter()
            .map(|(element, energy)| (element.clone(), toml::Value::Float(*energy)))
            .collect();
        config.insert("atomic_energies".into(), toml::Value::Table(energies));
        toml::to_string(&config).map_err(|e| EngineError::Template {
            format: "toml",
            message: e.to_string(),
        })
    }

    /// Offsets removed from training energies.
    fn energy_offsets(&self) -> Option<BTreeMap<String, f64>> {
        self.use_formation_energy.then(|| self.atomic_energies.clone())
    }

    /// Creates an untrained model adapted to `train` (elements, energy scale).
    pub fn initialize(&mut self, train: &Dataset) -> Result<(), EngineError> {
        self.ensure_uninitialized("initialize")?;
        let job = TrainerJob {
            ctx: self.ctx.clone(),
            executor: self.executor.clone(),
            config: self.trainer_config()?,
            offsets: self.energy_offsets(),
        };
        let train = train.file().clone();
        let file = self.ctx.submit("model.initialize", async move {
            let train = train.resolve().await?;
            job.run("initialize", &train, None, None).await
        });
        info!(model = %self.name, "Submitted model initialization");
        self.file = Some(file);
        Ok(())
    }

    /// Continues training from the current weights.
    pub fn train(&mut self, train: &Dataset, valid: &Dataset) -> Result<(), EngineError> {
        let previous = self
            .file
            .clone()
            .ok_or_else(|| EngineError::InvalidModel("cannot train before initialization".into()))?;
        let job = TrainerJob {
            ctx: self.ctx.clone(),
            executor: self.executor.clone(),
            config: self.trainer_config()?,
            offsets: self.energy_offsets(),
        };
        let inputs = train.file().join3(valid.file(), &previous);
        let file = self.ctx.submit("model.train", async move {
            let (train, valid, previous) = inputs.resolve().await?;
            job.run("train", &train, Some(&valid), Some(&previous)).await
        });
        info!(model = %self.name, "Submitted model training");
        self.file = Some(file);
        Ok(())
    }

    /// Discards the weights; atomic energies and configuration are kept.
    pub fn reset(&mut self) {
        self.file = None;
    }

    pub fn hamiltonian(&self) -> Result<Hamiltonian, EngineError> {
        let model = self
            .file
            .clone()
            .ok_or_else(|| EngineError::InvalidModel("model has not been initialized".into()))?;
        Ok(Hamiltonian::Learned(LearnedHamiltonian {
            model,
            executor: self.executor.clone(),
            atomic_energies: self.energy_offsets().unwrap_or_default(),
        }))
    }

    /// Writes `model.toml` now and the weights (if any) once they exist.
    pub fn save(&self, dir: &Path) -> Result<Deferred<()>, EngineError> {
        std::fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        let manifest = Manifest {
            name: self.name.clone(),
            executor: self.executor.clone(),
            use_formation_energy: self.use_formation_energy,
            atomic_energies: self.atomic_energies.clone(),
            config: self.config.clone(),
        };
        let path = dir.join(MANIFEST_FILE);
        let text = toml::to_string(&manifest).map_err(|e| EngineError::Toml {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, text).map_err(|e| EngineError::io(&path, e))?;

        let target = dir.join(MODEL_FILE);
        Ok(match &self.file {
            Some(file) => self.ctx.then_blocking("model.save", file, move |source| {
                std::fs::copy(&source, &target)
                    .map(|_| ())
                    .map_err(|e| TaskError::new("model.save", format!("{}: {e}", target.display())))
            }),
            None => {
                if target.exists() {
                    std::fs::remove_file(&target).map_err(|e| EngineError::io(&target, e))?;
                }
                Deferred::ready(())
            }
        })
    }

    pub fn load(ctx: &ExecutionContext, dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        let manifest: Manifest = toml::from_str(&text).map_err(|e| EngineError::Toml {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let weights = dir.join(MODEL_FILE);
        let file = if weights.exists() {
            let copy = ctx.new_file("model_", ".model");
            std::fs::copy(&weights, &copy).map_err(|e| EngineError::io(&weights, e))?;
            Some(Deferred::ready(copy))
        } else {
            None
        };
        debug!(model = %manifest.name, initialized = file.is_some(), "Loaded model");
        Ok(Self {
            ctx: ctx.clone(),
            name: manifest.name,
            config: manifest.config,
            executor: manifest.executor,
            atomic_energies: manifest.atomic_energies,
            use_formation_energy: manifest.use_formation_energy,
            file,
        })
    }
}

struct TrainerJob {
    ctx: ExecutionContext,
    executor: String,
    config: String,
    offsets: Option<BTreeMap<String, f64>>,
}

impl TrainerJob {
    async fn run(
        &self,
        mode: &'static str,
        train: &Path,
        valid: Option<&Path>,
        previous: Option<&Path>,
    ) -> Result<PathBuf, TaskError> {
        let task = format!("model.{mode}");
        let fail = |e: &dyn std::fmt::Display| TaskError::new(&task, e);

        let staged_train = self.ctx.new_file("train_", ".xyz");
        let ntrain = stage_training_data(train, &staged_train, self.offsets.as_ref())?;
        if ntrain == 0 {
            return Err(fail(&"no labeled geometries to train on"));
        }
        let mut invocation = self
            .ctx
            .invocation(&self.executor)
            .map_err(|e| fail(&e))?
            .arg(mode)
            .arg("--config")
            .arg("config.toml")
            .arg("--train")
            .arg("train.xyz")
            .input(InputFile::contents("config.toml", self.config.clone()))
            .input(InputFile::copy("train.xyz", staged_train));
        if let Some(valid) = valid {
            let staged_valid = self.ctx.new_file("valid_", ".xyz");
            stage_training_data(valid, &staged_valid, self.offsets.as_ref())?;
            invocation = invocation
                .arg("--valid")
                .arg("valid.xyz")
                .input(InputFile::copy("valid.xyz", staged_valid));
        }
        if let Some(previous) = previous {
            invocation = invocation
                .arg("--model")
                .arg("previous.model")
                .input(InputFile::copy("previous.model", previous));
        }
        let invocation = invocation.arg("--output").arg(MODEL_FILE);

        let outcome = self
            .ctx
            .run_process(&self.executor, invocation)
            .await
            .map_err(|e| fail(&e))?;
        let produced = outcome.output(MODEL_FILE);
        if !outcome.is_success() || !produced.exists() {
            return Err(fail(&format!(
                "trainer exited with {:?}; see {}",
                outcome.exit,
                outcome.stderr.display()
            )));
        }
        let file = self.ctx.new_file("model_", ".model");
        tokio::fs::copy(&produced, &file).await.map_err(|e| fail(&e))?;
        info!(mode, geometries = ntrain, "Trainer finished");
        Ok(file)
    }
}

/// Copies labeled, non-null geometries from `source` to `target`, replacing
/// total energies by formation energies when `offsets` is given.
fn stage_training_data(
    source: &Path,
    target: &Path,
    offsets: Option<&BTreeMap<String, f64>>,
) -> Result<usize, TaskError> {
    let mut geometries = read_geometries(source)?;
    geometries.retain(|g| !g.is_null() && g.energy.is_some());
    if let Some(offsets) = offsets {
        for geometry in &mut geometries {
            let mut offset = 0.0;
            for (number, count) in geometry.composition() {
                let symbol = element::symbol(number).unwrap_or("X");
                let energy = offsets.get(symbol).ok_or_else(|| {
                    TaskError::new("model.stage", format!("no atomic energy for element {symbol}"))
                })?;
                offset += energy * count as f64;
            }
            geometry.energy = geometry.energy.map(|e| e - offset);
        }
    }
    write_geometries(target, &geometries)?;
    Ok(geometries.len())
}
