use super::config::ConfigError;
use super::context::ExecutionContext;
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use crate::core::io::traits::GeometryFile;
use crate::core::io::xyz::XyzFile;
use crate::core::metrics::{self, ErrorQuery};
use crate::core::models::element;
use crate::core::models::geometry::Geometry;
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, Range};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) fn read_geometries(path: &Path) -> Result<Vec<Geometry>, TaskError> {
    XyzFile::read_from_path(path).map_err(|e| TaskError::new("read", format!("{}: {e}", path.display())))
}

pub(crate) fn write_geometries(path: &Path, geometries: &[Geometry]) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TaskError::new("write", format!("{}: {e}", parent.display())))?;
    }
    XyzFile::write_to_path(geometries, path)
        .map_err(|e| TaskError::new("write", format!("{}: {e}", path.display())))
}

/// Rows of a dataset to keep, in the order given.
#[derive(Debug, Clone)]
pub enum Selection {
    Range(Range<usize>),
    Indices(Vec<usize>),
    Deferred(Deferred<Vec<usize>>),
}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Selection::Range(range)
    }
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::Indices(indices)
    }
}

impl From<Deferred<Vec<usize>>> for Selection {
    fn from(indices: Deferred<Vec<usize>>) -> Self {
        Selection::Deferred(indices)
    }
}

fn pick(geometries: Vec<Geometry>, indices: &[usize]) -> Result<Vec<Geometry>, TaskError> {
    indices
        .iter()
        .map(|&i| {
            geometries.get(i).cloned().ok_or_else(|| {
                TaskError::new(
                    "dataset.select",
                    format!("index {i} out of range for dataset of length {}", geometries.len()),
                )
            })
        })
        .collect()
}

/// An ordered collection of geometries backed by an extended-XYZ file.
///
/// The file behind a dataset is written exactly once and never modified, so
/// any number of readers may use it concurrently. Every transformation writes a
/// new file and returns a new dataset; [`Dataset::append`] is the only method
/// that rebinds the receiver.
#[derive(Debug, Clone)]
pub struct Dataset {
    ctx: ExecutionContext,
    file: Deferred<PathBuf>,
}

impl Dataset {
    pub fn new(ctx: &ExecutionContext, geometries: Vec<Geometry>) -> Self {
        let path = ctx.new_file("data_", ".xyz");
        let file = ctx.submit_blocking("dataset.new", move || {
            write_geometries(&path, &geometries)?;
            Ok(path)
        });
        Self::from_deferred(ctx, file)
    }

    /// Wraps an existing file.
    pub fn load(ctx: &ExecutionContext, path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        std::fs::metadata(path).map_err(|e| EngineError::io(path, e))?;
        Ok(Self::from_deferred(ctx, Deferred::ready(path.to_path_buf())))
    }

    pub fn from_deferred(ctx: &ExecutionContext, file: Deferred<PathBuf>) -> Self {
        Self {
            ctx: ctx.clone(),
            file,
        }
    }

    /// Builds a dataset from individually computed geometries.
    pub fn from_states(ctx: &ExecutionContext, states: &[Deferred<Geometry>]) -> Self {
        let gathered = Deferred::gather(states);
        let path = ctx.new_file("data_", ".xyz");
        let file = ctx.then_blocking("dataset.from_states", &gathered, move |geometries| {
            write_geometries(&path, &geometries)?;
            Ok(path)
        });
        Self::from_deferred(ctx, file)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn file(&self) -> &Deferred<PathBuf> {
        &self.file
    }

    /// Copies the backing file to `path` once it is available.
    pub fn save(&self, path: impl Into<PathBuf>) -> Deferred<()> {
        let target = path.into();
        self.ctx.then_blocking("dataset.save", &self.file, move |source| {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| TaskError::new("dataset.save", e))?;
            }
            std::fs::copy(&source, &target)
                .map(|_| ())
                .map_err(|e| TaskError::new("dataset.save", format!("{}: {e}", target.display())))
        })
    }

    pub fn geometries(&self) -> Deferred<Vec<Geometry>> {
        self.ctx
            .then_blocking("dataset.geometries", &self.file, |path| read_geometries(&path))
    }

    pub fn length(&self) -> Deferred<usize> {
        self.ctx.then_blocking("dataset.length", &self.file, |path| {
            XyzFile::count_frames_in_path(&path).map_err(|e| TaskError::new("dataset.length", e))
        })
    }

    pub fn get(&self, index: usize) -> Deferred<Geometry> {
        self.get_at(&Deferred::ready(index))
    }

    pub fn get_at(&self, index: &Deferred<usize>) -> Deferred<Geometry> {
        let inputs = self.file.join(index);
        self.ctx.then_blocking("dataset.get", &inputs, |(path, index)| {
            XyzFile::read_frame_from_path(&path, index)
                .map_err(|e| TaskError::new("dataset.get", e))?
                .ok_or_else(|| TaskError::new("dataset.get", format!("index {index} out of range")))
        })
    }

    /// Writes the result of `f` applied to all geometries into a new dataset.
    pub(crate) fn derive<F>(&self, name: &'static str, f: F) -> Dataset
    where
        F: FnOnce(Vec<Geometry>) -> Result<Vec<Geometry>, TaskError> + Send + 'static,
    {
        let output = self.ctx.new_file("data_", ".xyz");
        let file = self.ctx.then_blocking(name, &self.file, move |input| {
            let geometries = f(read_geometries(&input)?)?;
            debug!(task = name, count = geometries.len(), "Derived dataset");
            write_geometries(&output, &geometries)?;
            Ok(output)
        });
        Self::from_deferred(&self.ctx, file)
    }

    pub fn select(&self, selection: impl Into<Selection>) -> Dataset {
        match selection.into() {
            Selection::Range(range) => self.derive("dataset.select", move |geometries| {
                let end = range.end.min(geometries.len());
                let start = range.start.min(end);
                Ok(geometries[start..end].to_vec())
            }),
            Selection::Indices(indices) => {
                self.derive("dataset.select", move |geometries| pick(geometries, &indices))
            }
            Selection::Deferred(indices) => {
                let output = self.ctx.new_file("data_", ".xyz");
                let inputs = self.file.join(&indices);
                let file = self.ctx.then_blocking("dataset.select", &inputs, move |(path, indices)| {
                    let selected = pick(read_geometries(&path)?, &indices)?;
                    write_geometries(&output, &selected)?;
                    Ok(output)
                });
                Self::from_deferred(&self.ctx, file)
            }
        }
    }

    /// Concatenates `other` onto this dataset, rebinding the receiver.
    pub fn append(&mut self, other: &Dataset) {
        *self = &*self + other;
    }

    /// Clears computed labels of every geometry.
    pub fn reset(&self) -> Dataset {
        self.derive("dataset.reset", |mut geometries| {
            geometries.iter_mut().for_each(Geometry::reset);
            Ok(geometries)
        })
    }

    pub fn clean(&self) -> Dataset {
        self.derive("dataset.clean", |mut geometries| {
            geometries.iter_mut().for_each(Geometry::clean);
            Ok(geometries)
        })
    }

    pub fn shuffle(&self) -> Dataset {
        self.derive("dataset.shuffle", |mut geometries| {
            geometries.shuffle(&mut rand::thread_rng());
            Ok(geometries)
        })
    }

    /// Randomly splits into a training part of `floor(n * train_fraction)`
    /// geometries and a validation part with the rest.
    pub fn split(&self, train_fraction: f64) -> Result<(Dataset, Dataset), EngineError> {
        if !(train_fraction > 0.0 && train_fraction < 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "train_fraction",
                reason: format!("{train_fraction} must lie strictly between 0 and 1"),
            }
            .into());
        }
        let indices = self.length().try_map(move |n| {
            let ntrain = (n as f64 * train_fraction).floor() as usize;
            if ntrain == 0 || ntrain == n {
                return Err(TaskError::new(
                    "dataset.split",
                    format!("cannot split {n} geometries with fraction {train_fraction}"),
                ));
            }
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rand::thread_rng());
            let valid = order.split_off(ntrain);
            Ok((order, valid))
        });
        let train = self.select(indices.map(|(train, _)| train));
        let valid = self.select(indices.map(|(_, valid)| valid));
        Ok((train, valid))
    }

    /// Inserts `energy - Σ reference(element) × count` as the formation energy.
    pub fn set_formation_energy(&self, atomic_energies: &BTreeMap<String, f64>) -> Dataset {
        let references = atomic_energies.clone();
        self.derive("dataset.set_formation_energy", move |mut geometries| {
            for (index, geometry) in geometries.iter_mut().enumerate() {
                if geometry.is_null() {
                    continue;
                }
                if geometry.formation_energy.is_some() {
                    return Err(TaskError::new(
                        "dataset.set_formation_energy",
                        format!("geometry {index} already has a formation energy"),
                    ));
                }
                let Some(energy) = geometry.energy else {
                    continue;
                };
                let mut reference = 0.0;
                for (number, count) in geometry.composition() {
                    let symbol = element::symbol(number).unwrap_or("X");
                    let e = references.get(symbol).ok_or_else(|| {
                        TaskError::new(
                            "dataset.set_formation_energy",
                            format!("no atomic energy for element {symbol}"),
                        )
                    })?;
                    reference += e * count as f64;
                }
                geometry.formation_energy = Some(energy - reference);
            }
            Ok(geometries)
        })
    }

    /// Per-geometry errors against `other`, or against zero when `other` is `None`.
    pub fn get_errors(
        &self,
        other: Option<&Dataset>,
        query: ErrorQuery,
    ) -> Result<Deferred<DMatrix<f64>>, EngineError> {
        query.validate()?;
        let errors = match other {
            Some(other) => {
                let inputs = self.file.join(&other.file);
                self.ctx.then_blocking("dataset.get_errors", &inputs, move |(a, b)| {
                    let (a, b) = (read_geometries(&a)?, read_geometries(&b)?);
                    metrics::compute_errors(&a, Some(&b), &query)
                        .map_err(|e| TaskError::new("dataset.get_errors", e))
                })
            }
            None => self.ctx.then_blocking("dataset.get_errors", &self.file, move |a| {
                metrics::compute_errors(&read_geometries(&a)?, None, &query)
                    .map_err(|e| TaskError::new("dataset.get_errors", e))
            }),
        };
        Ok(errors)
    }

    pub fn not_null(&self) -> Dataset {
        self.derive("dataset.not_null", |geometries| {
            Ok(geometries.into_iter().filter(|g| !g.is_null()).collect())
        })
    }

    /// Geometries for which labeling succeeded.
    pub fn success(&self) -> Dataset {
        self.derive("dataset.success", |geometries| {
            Ok(geometries.into_iter().filter(labeled).collect())
        })
    }

    pub fn failed(&self) -> Dataset {
        self.derive("dataset.failed", |geometries| {
            Ok(geometries.into_iter().filter(|g| !labeled(g)).collect())
        })
    }

    pub fn energies(&self) -> Deferred<Vec<Option<f64>>> {
        self.geometries()
            .map(|geometries| geometries.iter().map(|g| g.energy).collect())
    }

    pub fn elements(&self) -> Deferred<BTreeSet<String>> {
        self.geometries().map(|geometries| {
            geometries
                .iter()
                .filter(|g| !g.is_null())
                .flat_map(|g| g.elements())
                .map(str::to_string)
                .collect()
        })
    }

    /// Numbers every non-null geometry without an identifier, starting at `start`.
    ///
    /// Returns the new dataset and the next unused identifier.
    pub fn assign_identifiers(&self, start: &Deferred<u64>) -> (Dataset, Deferred<u64>) {
        let output = self.ctx.new_file("data_", ".xyz");
        let inputs = self.file.join(start);
        let result = self
            .ctx
            .then_blocking("dataset.assign_identifiers", &inputs, move |(path, start)| {
                let mut geometries = read_geometries(&path)?;
                let mut next = start;
                for geometry in geometries.iter_mut() {
                    if geometry.is_null() || geometry.identifier.is_some() {
                        continue;
                    }
                    geometry.identifier = Some(next);
                    next += 1;
                }
                write_geometries(&output, &geometries)?;
                Ok((output, next))
            });
        let dataset = Self::from_deferred(&self.ctx, result.map(|(path, _)| path));
        (dataset, result.map(|(_, next)| next))
    }
}

fn labeled(geometry: &Geometry) -> bool {
    !geometry.is_null() && geometry.energy.is_some()
}

impl Add<&Dataset> for &Dataset {
    type Output = Dataset;

    fn add(self, other: &Dataset) -> Dataset {
        let output = self.ctx.new_file("data_", ".xyz");
        let inputs = self.file.join(&other.file);
        let file = self.ctx.then_blocking("dataset.join", &inputs, move |(a, b)| {
            let mut geometries = read_geometries(&a)?;
            geometries.extend(read_geometries(&b)?);
            write_geometries(&output, &geometries)?;
            Ok(output)
        });
        Dataset::from_deferred(&self.ctx, file)
    }
}

impl Add for Dataset {
    type Output = Dataset;

    fn add(self, other: Dataset) -> Dataset {
        &self + &other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::xyz;
    use crate::core::metrics::{Metric, Property};
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use nalgebra::{Matrix3, Vector3};

    fn hydrogen(x: f64, energy: Option<f64>) -> Geometry {
        let mut g = Geometry::from_data(
            &[1, 1],
            &[Vector3::new(x, 0.0, 0.0), Vector3::new(x + 0.74, 0.0, 0.0)],
            Some(Matrix3::identity() * 10.0),
        )
        .unwrap();
        g.energy = energy;
        if energy.is_some() {
            for atom in g.atoms_mut() {
                atom.force = Vector3::new(0.1, -0.2, 0.3);
            }
        }
        g
    }

    fn texts(geometries: &[Geometry]) -> Vec<String> {
        geometries.iter().map(|g| xyz::to_string(g).unwrap()).collect()
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_leaves_source_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let mut labeled = hydrogen(0.0, Some(-1.0));
        labeled.order.insert("cv".into(), 0.5);
        let data = Dataset::new(&ctx, vec![labeled, hydrogen(1.0, Some(-2.0))]);
        let once = data.reset().geometries().resolve().await.unwrap();
        let twice = data.reset().reset().geometries().resolve().await.unwrap();
        assert_eq!(texts(&once), texts(&twice));
        assert!(once.iter().all(|g| g.energy.is_none() && !g.has_forces()));
        assert_eq!(once[0].order.get("cv"), Some(&0.5));
        let original = data.geometries().resolve().await.unwrap();
        assert_eq!(original[0].energy, Some(-1.0));
    }

    #[tokio::test]
    async fn formation_energy_subtracts_atomic_references() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, (0..10).map(|i| hydrogen(i as f64, Some(10.0))).collect());
        let energies = BTreeMap::from([("H".to_string(), 3.0)]);
        let result = data.set_formation_energy(&energies).geometries().resolve().await.unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.iter().all(|g| g.formation_energy == Some(4.0)));
    }

    #[tokio::test]
    async fn formation_energy_fails_when_element_missing_or_already_set() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, vec![hydrogen(0.0, Some(10.0))]);
        let none = BTreeMap::from([("O".to_string(), -400.0)]);
        assert!(data.set_formation_energy(&none).file().resolve().await.is_err());

        let energies = BTreeMap::from([("H".to_string(), 3.0)]);
        let twice = data.set_formation_energy(&energies).set_formation_energy(&energies);
        assert!(twice.file().resolve().await.is_err());
    }

    #[tokio::test]
    async fn append_preserves_order_and_selection_picks_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let mut data = Dataset::new(&ctx, vec![hydrogen(0.0, None), hydrogen(1.0, None)]);
        let other = Dataset::new(&ctx, vec![hydrogen(2.0, None)]);
        let before = data.clone();
        data.append(&other);
        assert_eq!(data.length().resolve().await, Ok(3));
        assert_eq!(before.length().resolve().await, Ok(2));

        let picked = data.select(vec![2, 0]).geometries().resolve().await.unwrap();
        assert_eq!(picked[0].atoms()[0].position.x, 2.0);
        assert_eq!(picked[1].atoms()[0].position.x, 0.0);
        let first = data.get(1).resolve().await.unwrap();
        assert_eq!(first.atoms()[0].position.x, 1.0);
        assert!(data.get(7).resolve().await.is_err());
        assert_eq!(data.select(1..10).length().resolve().await, Ok(2));
    }

    #[tokio::test]
    async fn identical_datasets_have_zero_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, vec![hydrogen(0.0, Some(-1.0)), hydrogen(1.0, Some(-2.0))]);
        let query = ErrorQuery::new(Metric::Rmse, vec![Property::Energy, Property::Forces]);
        let errors = data.get_errors(Some(&data), query).unwrap().resolve().await.unwrap();
        assert_eq!(errors.shape(), (2, 2));
        assert!(errors.iter().all(|&e| e == 0.0));
    }

    #[tokio::test]
    async fn invalid_error_query_fails_before_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, vec![hydrogen(0.0, Some(-1.0))]);
        let query = ErrorQuery::new(Metric::Mae, vec![Property::Energy]).with_elements(vec!["H".into()]);
        assert!(matches!(data.get_errors(None, query), Err(EngineError::Metrics { .. })));
    }

    #[tokio::test]
    async fn success_and_failed_partition_the_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(
            &ctx,
            vec![hydrogen(0.0, Some(-1.0)), Geometry::null(), hydrogen(1.0, None)],
        );
        assert_eq!(data.success().length().resolve().await, Ok(1));
        assert_eq!(data.failed().length().resolve().await, Ok(2));
        assert_eq!(data.not_null().length().resolve().await, Ok(2));
    }

    #[tokio::test]
    async fn split_and_shuffle_keep_every_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, (0..10).map(|i| hydrogen(i as f64, None)).collect());
        let (train, valid) = data.split(0.75).unwrap();
        assert_eq!(train.length().resolve().await, Ok(7));
        assert_eq!(valid.length().resolve().await, Ok(3));

        let mut xs: Vec<f64> = (&train + &valid)
            .geometries()
            .resolve()
            .await
            .unwrap()
            .iter()
            .map(|g| g.atoms()[0].position.x)
            .collect();
        xs.sort_by(f64::total_cmp);
        assert_eq!(xs, (0..10).map(|i| i as f64).collect::<Vec<_>>());
        assert_eq!(data.shuffle().length().resolve().await, Ok(10));
        assert!(data.split(1.0).is_err());
    }

    #[tokio::test]
    async fn identifiers_skip_null_and_already_numbered_geometries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let mut numbered = hydrogen(0.0, None);
        numbered.identifier = Some(100);
        let data = Dataset::new(&ctx, vec![hydrogen(1.0, None), Geometry::null(), numbered, hydrogen(2.0, None)]);
        let (data, next) = data.assign_identifiers(&Deferred::ready(5));
        let ids: Vec<_> = data
            .geometries()
            .resolve()
            .await
            .unwrap()
            .iter()
            .map(|g| g.identifier)
            .collect();
        assert_eq!(ids, vec![Some(5), None, Some(100), Some(6)]);
        assert_eq!(next.resolve().await, Ok(7));
    }

    #[tokio::test]
    async fn saved_copy_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let data = Dataset::new(&ctx, vec![hydrogen(0.0, Some(-1.0))]);
        let target = dir.path().join("out").join("saved.xyz");
        data.save(&target).resolve().await.unwrap();
        let loaded = Dataset::load(&ctx, &target).unwrap();
        assert_eq!(loaded.elements().resolve().await.unwrap(), BTreeSet::from(["H".to_string()]));
        assert!(Dataset::load(&ctx, dir.path().join("missing.xyz")).is_err());
    }
}
