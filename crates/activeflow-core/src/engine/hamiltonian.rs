use super::dataset::{Dataset, read_geometries, write_geometries};
use super::deferred::Deferred;
use super::error::TaskError;
use crate::core::models::element;
use crate::core::models::geometry::Geometry;
use crate::core::potentials::einstein::EinsteinCrystal;
use crate::core::potentials::plumed::PlumedBias;
use crate::core::potentials::{Potential, ZeroPotential};
use itertools::Itertools;
use nalgebra::{Matrix3, Vector3};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, Mul};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COEFFICIENT_TOLERANCE: f64 = 1e-10;

/// A trained model evaluated by an external program.
///
/// Energies predicted by the model are formation energies when
/// `atomic_energies` is non-empty; the reference contributions are added back
/// after evaluation.
#[derive(Debug, Clone)]
pub struct LearnedHamiltonian {
    pub model: Deferred<PathBuf>,
    pub executor: String,
    pub atomic_energies: BTreeMap<String, f64>,
}

impl PartialEq for LearnedHamiltonian {
    fn eq(&self, other: &Self) -> bool {
        self.model.same_node(&other.model)
            && self.executor == other.executor
            && self.atomic_energies == other.atomic_energies
    }
}

/// A weighted sum of non-mixture hamiltonians with distinct components.
#[derive(Debug, Clone, Default)]
pub struct MixtureHamiltonian {
    terms: Vec<(Hamiltonian, f64)>,
}

#[derive(Debug, Clone)]
pub enum Hamiltonian {
    EinsteinCrystal(EinsteinCrystal),
    PlumedBias(PlumedBias),
    Learned(LearnedHamiltonian),
    Mixture(MixtureHamiltonian),
}

/// How a component is described to the sampler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentEntry {
    pub name: String,
    pub kind: &'static str,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_constant: Option<f64>,
}

fn same_coefficient(a: f64, b: f64) -> bool {
    (a - b).abs() <= COEFFICIENT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

impl Hamiltonian {
    /// The additive identity.
    pub fn zero() -> Self {
        Hamiltonian::Mixture(MixtureHamiltonian::default())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Hamiltonian::EinsteinCrystal(_) => "EinsteinCrystal",
            Hamiltonian::PlumedBias(_) => "PlumedBias",
            Hamiltonian::Learned(_) => "Learned",
            Hamiltonian::Mixture(_) => "Mixture",
        }
    }

    /// `(component, coefficient)` pairs; a plain hamiltonian is its own single term.
    pub fn terms(&self) -> Vec<(Hamiltonian, f64)> {
        match self {
            Hamiltonian::Mixture(m) => m.terms.clone(),
            other => vec![(other.clone(), 1.0)],
        }
    }

    pub fn components(&self) -> Vec<Hamiltonian> {
        self.terms().into_iter().map(|(h, _)| h).collect()
    }

    pub fn coefficients(&self) -> Vec<f64> {
        self.terms().into_iter().map(|(_, c)| c).collect()
    }

    fn component_names(&self) -> Vec<String> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        self.components()
            .iter()
            .map(|h| {
                let count = counts.entry(h.kind()).or_insert(0);
                let name = format!("{}{}", h.kind(), count);
                *count += 1;
                name
            })
            .collect()
    }

    /// Component names (kind followed by a per-kind counter), sorted.
    pub fn names(&self) -> Vec<String> {
        self.component_names().into_iter().sorted().collect()
    }

    /// `(name, component, coefficient)` triples sorted by name.
    pub fn canonical(&self) -> Vec<(String, Hamiltonian, f64)> {
        self.component_names()
            .into_iter()
            .zip(self.terms())
            .map(|(name, (h, c))| (name, h, c))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect()
    }

    /// Coefficient of each of `components` within `self`, or 0 when absent.
    pub fn get_coefficients(&self, components: &[Hamiltonian]) -> Vec<f64> {
        let terms = self.terms();
        components
            .iter()
            .map(|component| {
                terms
                    .iter()
                    .find(|(h, _)| same_component(h, component))
                    .map_or(0.0, |(_, c)| *c)
            })
            .collect()
    }

    fn in_process(&self) -> Box<dyn Potential> {
        match self {
            Hamiltonian::EinsteinCrystal(e) => Box::new(e.clone()),
            Hamiltonian::PlumedBias(p) => Box::new(p.clone()),
            _ => Box::new(ZeroPotential),
        }
    }

    /// Labels every geometry of `dataset` with energy, forces and (if periodic) stress.
    ///
    /// Null geometries stay null.
    pub fn evaluate(&self, dataset: &Dataset) -> Dataset {
        match self {
            Hamiltonian::Learned(learned) => evaluate_learned(learned, dataset),
            Hamiltonian::Mixture(mixture) if !mixture.terms.is_empty() => {
                evaluate_mixture(mixture, dataset)
            }
            _ => {
                let potential = self.in_process();
                let kind = self.kind();
                dataset.derive("hamiltonian.evaluate", move |geometries| {
                    potential
                        .label(&geometries)
                        .map_err(|e| TaskError::new(format!("hamiltonian.evaluate.{kind}"), e))
                })
            }
        }
    }

    /// Writes the files the sampler needs to reconstruct this component.
    pub(crate) async fn serialize_component(&self, dir: &Path, name: &str) -> Result<ComponentEntry, TaskError> {
        let write_err = |e: std::io::Error| TaskError::new("hamiltonian.serialize", e);
        let (file, force_constant) = match self {
            Hamiltonian::EinsteinCrystal(e) => {
                let file = format!("{name}.xyz");
                write_geometries(&dir.join(&file), std::slice::from_ref(&e.reference))?;
                (file, Some(e.force_constant))
            }
            Hamiltonian::PlumedBias(p) => {
                let file = format!("{name}.dat");
                tokio::fs::write(dir.join(&file), p.input()).await.map_err(write_err)?;
                (file, None)
            }
            Hamiltonian::Learned(l) => {
                let file = format!("{name}.model");
                let model = l.model.resolve().await?;
                tokio::fs::copy(&model, dir.join(&file)).await.map_err(write_err)?;
                (file, None)
            }
            Hamiltonian::Mixture(_) => {
                return Err(TaskError::new(
                    "hamiltonian.serialize",
                    "mixtures are serialized component by component",
                ));
            }
        };
        Ok(ComponentEntry {
            name: name.to_string(),
            kind: self.kind(),
            file,
            force_constant,
        })
    }
}

fn same_component(a: &Hamiltonian, b: &Hamiltonian) -> bool {
    match (a, b) {
        (Hamiltonian::EinsteinCrystal(x), Hamiltonian::EinsteinCrystal(y)) => x == y,
        (Hamiltonian::PlumedBias(x), Hamiltonian::PlumedBias(y)) => x == y,
        (Hamiltonian::Learned(x), Hamiltonian::Learned(y)) => x == y,
        _ => false,
    }
}

impl PartialEq for Hamiltonian {
    fn eq(&self, other: &Self) -> bool {
        let live = |h: &Hamiltonian| -> Vec<(Hamiltonian, f64)> {
            h.terms().into_iter().filter(|(_, c)| *c != 0.0).collect()
        };
        let (a, b) = (live(self), live(other));
        a.len() == b.len()
            && a.iter().all(|(h, c)| {
                b.iter()
                    .any(|(g, d)| same_component(h, g) && same_coefficient(*c, *d))
            })
    }
}

impl Add<&Hamiltonian> for &Hamiltonian {
    type Output = Hamiltonian;

    fn add(self, other: &Hamiltonian) -> Hamiltonian {
        let mut terms = self.terms();
        for (h, c) in other.terms() {
            match terms.iter_mut().find(|(g, _)| same_component(g, &h)) {
                Some(term) => term.1 += c,
                None => terms.push((h, c)),
            }
        }
        Hamiltonian::Mixture(MixtureHamiltonian { terms })
    }
}

impl Add for Hamiltonian {
    type Output = Hamiltonian;

    fn add(self, other: Hamiltonian) -> Hamiltonian {
        &self + &other
    }
}

impl Mul<f64> for &Hamiltonian {
    type Output = Hamiltonian;

    fn mul(self, factor: f64) -> Hamiltonian {
        let terms = self.terms().into_iter().map(|(h, c)| (h, c * factor)).collect();
        Hamiltonian::Mixture(MixtureHamiltonian { terms })
    }
}

impl Mul<f64> for Hamiltonian {
    type Output = Hamiltonian;

    fn mul(self, factor: f64) -> Hamiltonian {
        &self * factor
    }
}

impl Mul<Hamiltonian> for f64 {
    type Output = Hamiltonian;

    fn mul(self, hamiltonian: Hamiltonian) -> Hamiltonian {
        &hamiltonian * self
    }
}

impl std::iter::Sum for Hamiltonian {
    fn sum<I: Iterator<Item = Hamiltonian>>(iter: I) -> Self {
        iter.fold(Hamiltonian::zero(), |acc, h| acc + h)
    }
}

fn evaluate_learned(learned: &LearnedHamiltonian, dataset: &Dataset) -> Dataset {
    let ctx = dataset.context().clone();
    let output = ctx.new_file("data_", ".xyz");
    let inputs = learned.model.join(dataset.file());
    let executor = learned.executor.clone();
    let atomic_energies = learned.atomic_energies.clone();
    let task = ctx.clone();
    let file = ctx.submit("hamiltonian.evaluate.Learned", async move {
        let fail = |e: &dyn std::fmt::Display| TaskError::new("hamiltonian.evaluate.Learned", e);
        let (model, data) = inputs.resolve().await?;
        let geometries = read_geometries(&data)?;
        let valid: Vec<Geometry> = geometries.iter().filter(|g| !g.is_null()).cloned().collect();

        let staged = task.new_file("evaluate_", ".xyz");
        write_geometries(&staged, &valid)?;
        let invocation = task
            .invocation(&executor)
            .map_err(|e| fail(&e))?
            .arg("evaluate")
            .arg("--model")
            .arg("model.pth")
            .arg("--data")
            .arg("data.xyz")
            .arg("--output")
            .arg("evaluated.xyz")
            .input(super::process::InputFile::copy("model.pth", model))
            .input(super::process::InputFile::copy("data.xyz", staged));
        let outcome = task.run_process(&executor, invocation).await.map_err(|e| fail(&e))?;
        if !outcome.is_success() {
            return Err(fail(&format!(
                "model evaluation exited with {:?}; see {}",
                outcome.exit,
                outcome.stderr.display()
            )));
        }
        let mut evaluated = read_geometries(&outcome.output("evaluated.xyz"))?.into_iter();
        if evaluated.len() != valid.len() {
            return Err(fail(&format!(
                "model returned {} geometries for {} inputs",
                evaluated.len(),
                valid.len()
            )));
        }

        let mut labeled = Vec::with_capacity(geometries.len());
        for geometry in geometries {
            if geometry.is_null() {
                labeled.push(geometry);
                continue;
            }
            let mut result = evaluated
                .next()
                .ok_or_else(|| fail(&"model output ended early"))?;
            if !atomic_energies.is_empty() {
                let offset = atomic_offset(&result, &atomic_energies).map_err(|e| fail(&e))?;
                result.energy = result.energy.map(|e| e + offset);
            }
            labeled.push(result);
        }
        debug!(count = labeled.len(), "Evaluated dataset with learned model");
        write_geometries(&output, &labeled)?;
        Ok(output)
    });
    Dataset::from_deferred(&ctx, file)
}

fn atomic_offset(geometry: &Geometry, atomic_energies: &BTreeMap<String, f64>) -> Result<f64, String> {
    geometry
        .composition()
        .into_iter()
        .map(|(number, count)| {
            let symbol = element::symbol(number).unwrap_or("X");
            atomic_energies
                .get(symbol)
                .map(|e| e * count as f64)
                .ok_or_else(|| format!("no atomic energy for element {symbol}"))
        })
        .sum()
}

fn evaluate_mixture(mixture: &MixtureHamiltonian, dataset: &Dataset) -> Dataset {
    let ctx = dataset.context().clone();
    let coefficients: Vec<f64> = mixture.terms.iter().map(|(_, c)| *c).collect();
    let files: Vec<Deferred<PathBuf>> = mixture
        .terms
        .iter()
        .map(|(h, _)| h.evaluate(dataset).file().clone())
        .collect();
    let inputs = dataset.file().join(&Deferred::gather(&files));
    let output = ctx.new_file("data_", ".xyz");
    let file = ctx.then_blocking("hamiltonian.evaluate.Mixture", &inputs, move |(source, parts)| {
        let mut geometries = read_geometries(&source)?;
        let evaluated = parts
            .iter()
            .map(|p| read_geometries(p))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, geometry) in geometries.iter_mut().enumerate() {
            if geometry.is_null() {
                continue;
            }
            let parts = evaluated
                .iter()
                .map(|component| component.get(i))
                .collect::<Option<Vec<&Geometry>>>()
                .ok_or_else(|| TaskError::new("hamiltonian.evaluate.Mixture", "component output is too short"))?;
            if parts
                .iter()
                .any(|part| part.is_null() || part.energy.is_none() || part.natoms() != geometry.natoms())
            {
                warn!(index = i, "A mixture component could not label the geometry; marking it null");
                *geometry = Geometry::null();
                continue;
            }
            let mut energy = 0.0;
            let mut forces = vec![Vector3::zeros(); geometry.natoms()];
            let mut stress = geometry.periodic().then(Matrix3::zeros);
            for (part, coefficient) in parts.iter().zip(&coefficients) {
                energy += coefficient * part.energy.unwrap_or_default();
                for (total, atom) in forces.iter_mut().zip(part.atoms()) {
                    *total += *coefficient * atom.force;
                }
                stress = stress.zip(part.stress).map(|(s, p)| s + p * *coefficient);
            }
            geometry.energy = Some(energy);
            geometry.stress = stress;
            for (atom, force) in geometry.atoms_mut().iter_mut().zip(forces) {
                atom.force = force;
            }
        }
        write_geometries(&output, &geometries)?;
        Ok(output)
    });
    Dataset::from_deferred(&ctx, file)
}
