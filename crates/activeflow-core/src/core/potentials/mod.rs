pub mod einstein;
pub mod plumed;

use crate::core::models::geometry::Geometry;
use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PotentialError {
    #[error("Geometry has {found} atoms but the potential expects {expected}")]
    AtomCountMismatch { expected: usize, found: usize },
    #[error("Atom index {index} is out of range for a geometry with {natoms} atoms")]
    AtomOutOfRange { index: usize, natoms: usize },
    #[error("Collective variable '{0}' requires a periodic geometry")]
    RequiresPeriodic(String),
    #[error("Action '{0}' cannot be evaluated in-process")]
    Unsupported(String),
}

/// Energy (eV), forces (eV/Å) and optionally stress (eV/Å³) for one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub energy: f64,
    pub forces: Vec<Vector3<f64>>,
    pub stress: Option<Matrix3<f64>>,
}

impl Evaluation {
    pub fn zero(natoms: usize, periodic: bool) -> Self {
        Self {
            energy: 0.0,
            forces: vec![Vector3::zeros(); natoms],
            stress: periodic.then(Matrix3::zeros),
        }
    }

    /// Writes energy, forces and stress onto a copy of `geometry`.
    pub fn apply_to(&self, geometry: &Geometry) -> Geometry {
        let mut labeled = geometry.clone();
        labeled.energy = Some(self.energy);
        labeled.stress = self.stress;
        for (atom, force) in labeled.atoms_mut().iter_mut().zip(&self.forces) {
            atom.force = *force;
        }
        labeled
    }
}

/// A potential that can be evaluated without launching an external program.
pub trait Potential: Send + Sync {
    fn compute(&self, geometry: &Geometry) -> Result<Evaluation, PotentialError>;

    /// Labels each geometry; null geometries pass through unchanged.
    fn label(&self, geometries: &[Geometry]) -> Result<Vec<Geometry>, PotentialError> {
        #[cfg(feature = "parallel")]
        use rayon::prelude::*;

        #[cfg(feature = "parallel")]
        let iter = geometries.par_iter();
        #[cfg(not(feature = "parallel"))]
        let iter = geometries.iter();

        iter.map(|g| {
            if g.is_null() {
                Ok(g.clone())
            } else {
                self.compute(g).map(|e| e.apply_to(g))
            }
        })
        .collect()
    }
}

/// Zero-energy potential, the additive identity of hamiltonian mixtures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZeroPotential;

impl Potential for ZeroPotential {
    fn compute(&self, geometry: &Geometry) -> Result<Evaluation, PotentialError> {
        Ok(Evaluation::zero(geometry.natoms(), geometry.periodic()))
    }
}
