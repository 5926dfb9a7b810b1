use super::{Evaluation, Potential, PotentialError};
use crate::core::models::geometry::Geometry;
use nalgebra::Matrix3;

/// Harmonic restraint of every atom to its position in a reference geometry.
///
/// `E = ½ k Σ |rᵢ − rᵢ⁰|²` with `k` in eV/Å².
#[derive(Debug, Clone, PartialEq)]
pub struct EinsteinCrystal {
    pub reference: Geometry,
    pub force_constant: f64,
}

impl EinsteinCrystal {
    pub fn new(reference: Geometry, force_constant: f64) -> Self {
        Self {
            reference,
            force_constant,
        }
    }
}

impl Potential for EinsteinCrystal {
    fn compute(&self, geometry: &Geometry) -> Result<Evaluation, PotentialError> {
        if geometry.natoms() != self.reference.natoms() {
            return Err(PotentialError::AtomCountMismatch {
                expected: self.reference.natoms(),
                found: geometry.natoms(),
            });
        }
        let k = self.force_constant;
        let mut energy = 0.0;
        let forces = geometry
            .atoms()
            .iter()
            .zip(self.reference.atoms())
            .map(|(atom, anchor)| {
                let displacement = atom.position - anchor.position;
                energy += 0.5 * k * displacement.norm_squared();
                -k * displacement
            })
            .collect();
        Ok(Evaluation {
            energy,
            forces,
            stress: geometry.periodic().then(Matrix3::zeros),
        })
    }
}
