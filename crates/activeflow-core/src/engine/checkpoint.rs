use super::context::ExecutionContext;
use super::dataset::{Dataset, read_geometries, write_geometries};
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use super::model::Model;
use super::walker::Walker;
use crate::core::models::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MARKER_FILE: &str = "checkpoint.toml";
pub const MODEL_DIR: &str = "model";
pub const WALKERS_DIR: &str = "walkers";
pub const TRAIN_FILE: &str = "train.xyz";
pub const VALID_FILE: &str = "valid.xyz";

/// Written last; a directory without it is an incomplete checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub iteration: usize,
    /// Next free geometry identifier.
    pub identifier: u64,
    pub nwalkers: usize,
}

pub fn iteration_dir(output: &Path, iteration: usize) -> PathBuf {
    output.join(iteration.to_string())
}

fn walker_file(dir: &Path, index: usize, kind: &str) -> PathBuf {
    dir.join(WALKERS_DIR).join(format!("walker_{index}_{kind}.xyz"))
}

/// Everything that makes up the state of the learning loop after one iteration.
pub struct Snapshot<'a> {
    pub iteration: usize,
    pub model: &'a Model,
    pub walkers: &'a [Walker],
    pub train: &'a Dataset,
    pub valid: &'a Dataset,
    pub identifier: &'a Deferred<u64>,
}

/// Persists `snapshot` under `<output>/<iteration>/`.
///
/// The returned handle resolves once the marker has been renamed into place.
pub fn write(ctx: &ExecutionContext, output: &Path, snapshot: Snapshot<'_>) -> Result<Deferred<()>, EngineError> {
    let dir = iteration_dir(output, snapshot.iteration);
    std::fs::create_dir_all(dir.join(WALKERS_DIR)).map_err(|e| EngineError::io(&dir, e))?;
    let marker_path = dir.join(MARKER_FILE);
    if marker_path.exists() {
        std::fs::remove_file(&marker_path).map_err(|e| EngineError::io(&marker_path, e))?;
    }

    let mut parts = vec![
        snapshot.model.save(&dir.join(MODEL_DIR))?,
        snapshot.train.save(dir.join(TRAIN_FILE)),
        snapshot.valid.save(dir.join(VALID_FILE)),
    ];
    for (i, walker) in snapshot.walkers.iter().enumerate() {
        for (kind, geometry) in [("start", walker.start()), ("state", walker.state())] {
            let path = walker_file(&dir, i, kind);
            parts.push(ctx.then_blocking("checkpoint.walker", geometry, move |g: Geometry| {
                write_geometries(&path, std::slice::from_ref(&g))
            }));
        }
    }

    let marker = CheckpointMarker {
        iteration: snapshot.iteration,
        identifier: 0,
        nwalkers: snapshot.walkers.len(),
    };
    let written = Deferred::gather(&parts).join(snapshot.identifier);
    Ok(ctx.then_blocking("checkpoint.marker", &written, move |(_, identifier)| {
        let marker = CheckpointMarker { identifier, ..marker };
        let text = toml::to_string(&marker).map_err(|e| TaskError::new("checkpoint.marker", e))?;
        let staging = dir.join(format!("{MARKER_FILE}.tmp"));
        std::fs::write(&staging, text)
            .and_then(|_| std::fs::rename(&staging, &marker_path))
            .map_err(|e| TaskError::new("checkpoint.marker", format!("{}: {e}", marker_path.display())))?;
        info!(iteration = marker.iteration, dir = %dir.display(), "Checkpoint written");
        Ok(())
    }))
}

pub fn read_marker(dir: &Path) -> Result<CheckpointMarker, EngineError> {
    let path = dir.join(MARKER_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
    toml::from_str(&text).map_err(|e| EngineError::Toml {
        path,
        message: e.to_string(),
    })
}

/// The complete checkpoint with the highest iteration number, if any.
pub fn latest(output: &Path) -> Result<Option<CheckpointMarker>, EngineError> {
    if !output.exists() {
        return Ok(None);
    }
    let entries = std::fs::read_dir(output).map_err(|e| EngineError::io(output, e))?;
    let mut iterations: Vec<usize> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().join(MARKER_FILE).is_file())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    iterations.sort_unstable();
    match iterations.last() {
        Some(&iteration) => {
            let marker = read_marker(&iteration_dir(output, iteration))?;
            debug!(iteration, "Found checkpoint");
            Ok(Some(marker))
        }
        None => Ok(None),
    }
}

/// Loop state read back from a checkpoint directory.
#[derive(Debug)]
pub struct Restored {
    pub marker: CheckpointMarker,
    pub model: Model,
    pub train: Dataset,
    pub valid: Dataset,
}

fn read_single(path: &Path) -> Result<Geometry, EngineError> {
    read_geometries(path)?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Internal(format!("{} holds no geometry", path.display())))
}

/// Loads the checkpoint of `iteration` and restores walker starts and states in place.
pub fn restore(
    ctx: &ExecutionContext,
    output: &Path,
    iteration: usize,
    walkers: &mut [Walker],
) -> Result<Restored, EngineError> {
    let dir = iteration_dir(output, iteration);
    let marker = read_marker(&dir)?;
    if marker.nwalkers != walkers.len() {
        return Err(EngineError::InvalidWalker(format!(
            "checkpoint {iteration} holds {} walkers but {} were given",
            marker.nwalkers,
            walkers.len()
        )));
    }
    for (i, walker) in walkers.iter_mut().enumerate() {
        let start = read_single(&walker_file(&dir, i, "start"))?;
        let state = read_single(&walker_file(&dir, i, "state"))?;
        walker.set_start(Deferred::ready(start));
        walker.set_state(Deferred::ready(state));
    }
    let restored = Restored {
        model: Model::load(ctx, &dir.join(MODEL_DIR))?,
        train: Dataset::load(ctx, dir.join(TRAIN_FILE))?,
        valid: Dataset::load(ctx, dir.join(VALID_FILE))?,
        marker,
    };
    info!(iteration, "Restored checkpoint");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::potentials::einstein::EinsteinCrystal;
    use crate::engine::hamiltonian::Hamiltonian;
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use nalgebra::{Matrix3, Vector3};

    fn geometry(x: f64) -> Geometry {
        Geometry::from_data(&[8], &[Vector3::new(x, 0.0, 0.0)], Some(Matrix3::identity() * 5.0)).unwrap()
    }

    fn walkers() -> Vec<Walker> {
        let h = Hamiltonian::EinsteinCrystal(EinsteinCrystal::new(geometry(0.0), 1.0));
        (0..2).map(|i| Walker::new(geometry(i as f64), h.clone()).unwrap()).collect()
    }

    #[tokio::test]
    async fn written_checkpoint_is_found_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir.path().join("context"), ScriptedLauncher::new());
        let output = dir.path().join("output");
        let model = Model::new(&ctx, "mace", toml::Table::new());
        let mut original = walkers();
        original[1].set_state(Deferred::ready(geometry(3.0)));
        let train = Dataset::new(&ctx, vec![geometry(0.5), geometry(0.6)]);
        let valid = Dataset::new(&ctx, vec![geometry(0.7)]);

        assert_eq!(latest(&output).unwrap(), None);
        for iteration in [0, 1] {
            write(
                &ctx,
                &output,
                Snapshot {
                    iteration,
                    model: &model,
                    walkers: &original,
                    train: &train,
                    valid: &valid,
                    identifier: &Deferred::ready(42),
                },
            )
            .unwrap()
            .resolve()
            .await
            .unwrap();
        }
        std::fs::create_dir_all(output.join("2")).unwrap();

        let marker = latest(&output).unwrap().unwrap();
        assert_eq!(
            marker,
            CheckpointMarker {
                iteration: 1,
                identifier: 42,
                nwalkers: 2
            }
        );

        let mut fresh = walkers();
        let restored = restore(&ctx, &output, marker.iteration, &mut fresh).unwrap();
        assert_eq!(fresh[1].start().resolve().await.unwrap(), geometry(1.0));
        assert_eq!(fresh[1].state().resolve().await.unwrap(), geometry(3.0));
        assert_eq!(restored.train.length().resolve().await, Ok(2));
        assert_eq!(restored.model.name(), "mace");
        assert!(restore(&ctx, &output, 1, &mut fresh[..1]).is_err());
    }

    #[tokio::test]
    async fn failed_input_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let output = dir.path().join("output");
        let model = Model::new(&ctx, "mace", toml::Table::new());
        let broken = Dataset::from_deferred(&ctx, Deferred::failed(TaskError::new("label", "boom")));
        let pending = write(
            &ctx,
            &output,
            Snapshot {
                iteration: 0,
                model: &model,
                walkers: &walkers(),
                train: &broken,
                valid: &broken,
                identifier: &Deferred::ready(0),
            },
        )
        .unwrap();
        assert!(pending.resolve().await.is_err());
        assert_eq!(latest(&output).unwrap(), None);
    }
}
