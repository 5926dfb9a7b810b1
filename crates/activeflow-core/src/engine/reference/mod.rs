//! Reference evaluators: the expensive, trusted method used to label geometries.
//!
//! A [`Reference`] turns geometries into labeled geometries by running one
//! external single-point calculation per geometry. Failed calculations are not
//! errors; they produce null geometries that carry a pointer to the program's
//! output for inspection.

pub mod cp2k;

use super::config::ConfigError;
use super::context::ExecutionContext;
use super::dataset::{Dataset, read_geometries, write_geometries};
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use crate::core::metrics::Property;
use crate::core::models::element;
use crate::core::models::geometry::{Atom, Geometry};
use crate::engine::process::InputFile;
use futures_util::future;
use nalgebra::{Matrix3, Vector3};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Program-specific part of a reference calculation.
pub trait ReferenceBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Input files for a single point on `geometry`.
    fn prepare(&self, geometry: &Geometry, properties: &[Property]) -> Result<Vec<InputFile>, EngineError>;

    /// Extra command-line arguments after the executor's own.
    fn arguments(&self) -> Vec<String>;

    /// The labeled geometry, or `None` if the output does not contain a usable result.
    fn parse(&self, stdout: &str, properties: &[Property], geometry: &Geometry) -> Option<Geometry>;

    /// Backends to try for an isolated atom, each with a short description.
    fn single_atom_variants(&self, number: u8) -> Result<Vec<(String, Arc<dyn ReferenceBackend>)>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct Reference {
    backend: Arc<dyn ReferenceBackend>,
    properties: Vec<Property>,
    executor: String,
}

impl Reference {
    pub fn new(
        backend: Arc<dyn ReferenceBackend>,
        properties: Vec<Property>,
        executor: impl Into<String>,
    ) -> Result<Self, EngineError> {
        if !matches!(properties.as_slice(), [Property::Energy] | [Property::Energy, Property::Forces]) {
            return Err(ConfigError::InvalidParameter {
                name: "properties",
                reason: format!("expected [energy] or [energy, forces], got {properties:?}"),
            }
            .into());
        }
        Ok(Self {
            backend,
            properties,
            executor: executor.into(),
        })
    }

    /// CP2K computing energies and forces on the `reference` executor.
    pub fn cp2k(input: &str) -> Result<Self, EngineError> {
        Self::new(
            Arc::new(cp2k::Cp2k::new(input)?),
            vec![Property::Energy, Property::Forces],
            "reference",
        )
    }

    pub fn backend(&self) -> &Arc<dyn ReferenceBackend> {
        &self.backend
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    /// Labels a single geometry; null input gives null output.
    pub fn evaluate(&self, ctx: &ExecutionContext, geometry: &Deferred<Geometry>) -> Deferred<Geometry> {
        let job = self.job(ctx);
        let geometry = geometry.clone();
        ctx.submit("reference.evaluate", async move {
            let geometry = geometry.resolve().await?;
            job.label(geometry).await
        })
    }

    /// Labels every geometry of `dataset`, one external calculation each.
    pub fn evaluate_dataset(&self, dataset: &Dataset) -> Dataset {
        let ctx = dataset.context();
        let job = self.job(ctx);
        let source = dataset.file().clone();
        let output = ctx.new_file("data_", ".xyz");
        let file = ctx.submit("reference.evaluate_dataset", async move {
            let geometries = read_geometries(&source.resolve().await?)?;
            let total = geometries.len();
            let labeled = future::try_join_all(geometries.into_iter().map(|g| job.label(g))).await?;
            let failed = labeled.iter().filter(|g| g.is_null()).count();
            info!(total, failed, "Reference evaluation finished");
            write_geometries(&output, &labeled)?;
            Ok(output)
        });
        Dataset::from_deferred(ctx, file)
    }

    /// Energy of an isolated atom: the lowest over every allowed spin
    /// multiplicity. `box_size` (Å) sets a cubic cell; without it the atom is
    /// non-periodic, which backends needing a cell reject.
    pub async fn compute_atomic_energy(
        &self,
        ctx: &ExecutionContext,
        element: &str,
        box_size: Option<f64>,
    ) -> Result<f64, EngineError> {
        let number = element::atomic_number(element).ok_or_else(|| ConfigError::InvalidParameter {
            name: "element",
            reason: format!("unknown element '{element}'"),
        })?;
        let atom = Geometry::from_atoms(
            vec![Atom::new(number, Vector3::zeros())],
            box_size.map_or_else(Matrix3::zeros, |size| Matrix3::identity() * size),
        );
        let variants = self.backend.single_atom_variants(number)?;
        let jobs = variants.iter().map(|(description, backend)| {
            let job = Job {
                ctx: ctx.clone(),
                backend: backend.clone(),
                properties: self.properties.clone(),
                executor: self.executor.clone(),
            };
            let atom = atom.clone();
            async move {
                let labeled = job.label(atom).await?;
                let energy = labeled.energy.filter(|_| !labeled.is_null());
                info!(element, variant = %description, energy = ?energy, "Isolated atom energy");
                Ok::<_, TaskError>(energy)
            }
        });
        let energies = future::try_join_all(jobs).await?;
        energies
            .into_iter()
            .flatten()
            .min_by(f64::total_cmp)
            .ok_or_else(|| EngineError::AtomicEnergy {
                element: element.to_string(),
            })
    }

    fn job(&self, ctx: &ExecutionContext) -> Job {
        Job {
            ctx: ctx.clone(),
            backend: self.backend.clone(),
            properties: self.properties.clone(),
            executor: self.executor.clone(),
        }
    }
}

/// Everything a single-point task needs, detached from the `Reference` borrow.
#[derive(Clone)]
struct Job {
    ctx: ExecutionContext,
    backend: Arc<dyn ReferenceBackend>,
    properties: Vec<Property>,
    executor: String,
}

impl Job {
    async fn label(&self, geometry: Geometry) -> Result<Geometry, TaskError> {
        let task = format!("reference.{}", self.backend.name());
        if geometry.is_null() {
            return Ok(Geometry::null());
        }
        let inputs = self
            .backend
            .prepare(&geometry, &self.properties)
            .map_err(|e| TaskError::new(&task, e))?;
        let mut invocation = self
            .ctx
            .invocation(&self.executor)
            .map_err(|e| TaskError::new(&task, e))?;
        for arg in self.backend.arguments() {
            invocation = invocation.arg(arg);
        }
        for input in inputs {
            invocation = invocation.input(input);
        }
        let outcome = self
            .ctx
            .run_process(&self.executor, invocation)
            .await
            .map_err(|e| TaskError::new(&task, e))?;

        let pointer = outcome.stdout.display().to_string();
        let parsed = match tokio::fs::read_to_string(&outcome.stdout).await {
            Ok(stdout) => outcome
                .is_success()
                .then(|| self.backend.parse(&stdout, &self.properties, &geometry))
                .flatten(),
            Err(e) => {
                warn!(stdout = %pointer, error = %e, "Reference output is unreadable");
                None
            }
        };
        match parsed {
            Some(mut labeled) => {
                debug!(stdout = %pointer, "Reference calculation succeeded");
                labeled.stdout = Some(pointer);
                Ok(labeled)
            }
            None => {
                warn!(exit = ?outcome.exit, stdout = %pointer, "Reference calculation failed");
                let mut null = Geometry::null();
                null.stdout = Some(pointer);
                Ok(null)
            }
        }
    }
}
