use super::cell::{self, CellError};
use super::element;
use nalgebra::{Matrix3, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Relative tolerance used when comparing positions and cells.
pub const EQUALITY_RTOL: f64 = 1e-5;
/// Absolute tolerance used when comparing positions and cells.
pub const EQUALITY_ATOL: f64 = 1e-8;

/// A single atom: species, Cartesian position (Å) and force (eV/Å).
///
/// Forces are NaN-filled when they have not been computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Atom {
    pub number: u8,
    pub position: Vector3<f64>,
    pub force: Vector3<f64>,
}

impl Atom {
    pub fn new(number: u8, position: Vector3<f64>) -> Self {
        Self {
            number,
            position,
            force: Vector3::repeat(f64::NAN),
        }
    }

    #[inline]
    pub fn has_force(&self) -> bool {
        !self.force.iter().any(|f| f.is_nan())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{numbers} atomic numbers given for {positions} positions")]
    LengthMismatch { numbers: usize, positions: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Status {
    #[default]
    Valid,
    Null,
}

/// One atomic configuration together with its optional labels.
///
/// A geometry is either *valid* or the tagged *null* geometry, which stands in
/// for the result of a failed computation. The null geometry only compares equal
/// to another null geometry, regardless of how many atoms it carries.
#[derive(Debug, Clone)]
pub struct Geometry {
    atoms: Vec<Atom>,
    cell: Matrix3<f64>,
    pub energy: Option<f64>,
    pub stress: Option<Matrix3<f64>>,
    pub delta: Option<f64>,
    pub phase: Option<String>,
    pub logprob: Option<Vec<f64>>,
    pub formation_energy: Option<f64>,
    pub order: BTreeMap<String, f64>,
    pub stdout: Option<String>,
    pub identifier: Option<u64>,
    status: Status,
}

impl Geometry {
    /// Creates an unlabeled geometry. A `None` cell means non-periodic.
    pub fn from_data(
        numbers: &[u8],
        positions: &[Vector3<f64>],
        cell: Option<Matrix3<f64>>,
    ) -> Result<Self, GeometryError> {
        if numbers.len() != positions.len() {
            return Err(GeometryError::LengthMismatch {
                numbers: numbers.len(),
                positions: positions.len(),
            });
        }
        let atoms = numbers
            .iter()
            .zip(positions)
            .map(|(&n, &p)| Atom::new(n, p))
            .collect();
        Ok(Self::from_atoms(atoms, cell.unwrap_or_else(Matrix3::zeros)))
    }

    pub fn from_atoms(atoms: Vec<Atom>, cell: Matrix3<f64>) -> Self {
        Self {
            atoms,
            cell,
            energy: None,
            stress: None,
            delta: None,
            phase: None,
            logprob: None,
            formation_energy: None,
            order: BTreeMap::new(),
            stdout: None,
            identifier: None,
            status: Status::Valid,
        }
    }

    /// The tagged failure geometry: one dummy atom at the origin, no cell.
    pub fn null() -> Self {
        let mut geometry = Self::from_atoms(vec![Atom::new(0, Vector3::zeros())], Matrix3::zeros());
        geometry.status = Status::Null;
        geometry
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.status == Status::Null
    }

    #[inline]
    pub fn natoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Mutable access to per-atom records. The number of atoms cannot change.
    pub fn atoms_mut(&mut self) -> &mut [Atom] {
        &mut self.atoms
    }

    pub fn cell(&self) -> &Matrix3<f64> {
        &self.cell
    }

    pub fn set_cell(&mut self, cell: Matrix3<f64>) {
        self.cell = cell;
    }

    #[inline]
    pub fn periodic(&self) -> bool {
        !cell::is_zero(&self.cell)
    }

    /// Cell volume in Å³, or NaN for non-periodic geometries.
    pub fn volume(&self) -> f64 {
        if self.periodic() {
            self.cell.determinant()
        } else {
            f64::NAN
        }
    }

    pub fn per_atom_energy(&self) -> Option<f64> {
        self.energy.map(|e| e / self.natoms() as f64)
    }

    /// `true` if every atom carries a finite force vector.
    pub fn has_forces(&self) -> bool {
        !self.atoms.is_empty() && self.atoms.iter().all(Atom::has_force)
    }

    pub fn numbers(&self) -> Vec<u8> {
        self.atoms.iter().map(|a| a.number).collect()
    }

    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    pub fn forces(&self) -> Vec<Vector3<f64>> {
        self.atoms.iter().map(|a| a.force).collect()
    }

    /// Number of atoms per atomic number.
    pub fn composition(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for atom in &self.atoms {
            *counts.entry(atom.number).or_insert(0) += 1;
        }
        counts
    }

    /// Chemical symbols present in this geometry.
    pub fn elements(&self) -> BTreeSet<&'static str> {
        self.atoms
            .iter()
            .filter_map(|a| element::symbol(a.number))
            .collect()
    }

    /// Clears computed labels. Topology tags (`order`, `stdout`, `identifier`) are kept.
    pub fn reset(&mut self) {
        self.energy = None;
        self.stress = None;
        self.delta = None;
        self.phase = None;
        self.logprob = None;
        self.formation_energy = None;
        for atom in &mut self.atoms {
            atom.force = Vector3::repeat(f64::NAN);
        }
    }

    /// Clears every label, including topology tags.
    pub fn clean(&mut self) {
        self.reset();
        self.order.clear();
        self.stdout = None;
        self.identifier = None;
    }

    /// Canonicalizes the cell to reduced lower-triangular form. No-op if non-periodic.
    pub fn align_axes(&mut self) -> Result<(), CellError> {
        if !self.periodic() {
            return Ok(());
        }
        let mut positions = self.positions();
        cell::transform_lower_triangular(&mut positions, &mut self.cell)?;
        cell::reduce_box_vectors(&mut self.cell)?;
        for (atom, position) in self.atoms.iter_mut().zip(positions) {
            atom.position = position;
        }
        Ok(())
    }

    pub(crate) fn mark_null(&mut self) {
        self.status = Status::Null;
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::null()
    }
}

#[inline]
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= EQUALITY_ATOL + EQUALITY_RTOL * b.abs()
}

impl PartialEq for Geometry {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => return true,
            (false, false) => {}
            _ => return false,
        }
        if self.natoms() != other.natoms() || self.periodic() != other.periodic() {
            return false;
        }
        let atoms_match = self.atoms.iter().zip(&other.atoms).all(|(a, b)| {
            a.number == b.number
                && a.position
                    .iter()
                    .zip(b.position.iter())
                    .all(|(&x, &y)| is_close(x, y))
        });
        atoms_match
            && self
                .cell
                .iter()
                .zip(other.cell.iter())
                .all(|(&x, &y)| is_close(x, y))
    }
}
