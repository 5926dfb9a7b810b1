use crate::core::models::element;
use crate::core::models::geometry::Geometry;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Conversion factor from eV/Å³ to MPa.
pub const EV_PER_A3_TO_MPA: f64 = 160_217.662_08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    Energy,
    Forces,
    Stress,
}

impl Property {
    pub fn unit(&self) -> &'static str {
        match self {
            Property::Energy => "meV/atom",
            Property::Forces => "meV/angstrom",
            Property::Stress => "MPa",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Property::Energy => "energy",
            Property::Forces => "forces",
            Property::Stress => "stress",
        };
        f.write_str(name)
    }
}

impl FromStr for Property {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "energy" => Ok(Property::Energy),
            "forces" => Ok(Property::Forces),
            "stress" => Ok(Property::Stress),
            _ => Err(MetricsError::UnknownProperty(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Mae,
    #[default]
    Rmse,
    Max,
}

impl FromStr for Metric {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mae" => Ok(Metric::Mae),
            "rmse" => Ok(Metric::Rmse),
            "max" => Ok(Metric::Max),
            _ => Err(MetricsError::UnknownMetric(s.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Unknown property '{0}' (expected energy, forces or stress)")]
    UnknownProperty(String),
    #[error("Unknown metric '{0}' (expected mae, rmse or max)")]
    UnknownMetric(String),
    #[error("At least one property is required")]
    NoProperties,
    #[error("Element and atom index filters are only valid for forces-only queries")]
    MaskRequiresForces,
    #[error("Unknown element '{0}'")]
    UnknownElement(String),
    #[error("Datasets have different lengths ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("Geometry {index} differs in numbers or positions between datasets")]
    TopologyMismatch { index: usize },
    #[error("Geometry {index} is missing property '{property}'")]
    MissingProperty { index: usize, property: Property },
    #[error("No geometry in the dataset contains atoms of interest")]
    NoTargetAtoms,
}

/// Describes which error statistic to compute and over which atoms.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorQuery {
    pub metric: Metric,
    pub properties: Vec<Property>,
    pub elements: Option<Vec<String>>,
    pub atom_indices: Option<Vec<usize>>,
}

impl Default for ErrorQuery {
    fn default() -> Self {
        Self {
            metric: Metric::Rmse,
            properties: vec![Property::Energy, Property::Forces, Property::Stress],
            elements: None,
            atom_indices: None,
        }
    }
}

impl ErrorQuery {
    pub fn new(metric: Metric, properties: Vec<Property>) -> Self {
        Self {
            metric,
            properties,
            elements: None,
            atom_indices: None,
        }
    }

    pub fn with_elements(mut self, elements: Vec<String>) -> Self {
        self.elements = Some(elements);
        self
    }

    pub fn with_atom_indices(mut self, indices: Vec<usize>) -> Self {
        self.atom_indices = Some(indices);
        self
    }

    /// Checks the query for contract violations and resolves element symbols.
    pub fn validate(&self) -> Result<Option<Vec<u8>>, MetricsError> {
        if self.properties.is_empty() {
            return Err(MetricsError::NoProperties);
        }
        let masked = self.elements.is_some() || self.atom_indices.is_some();
        if masked && self.properties != [Property::Forces] {
            return Err(MetricsError::MaskRequiresForces);
        }
        self.elements
            .as_ref()
            .map(|symbols| {
                symbols
                    .iter()
                    .map(|s| {
                        element::atomic_number(s)
                            .ok_or_else(|| MetricsError::UnknownElement(s.clone()))
                    })
                    .collect()
            })
            .transpose()
    }
}

fn atom_mask(geometry: &Geometry, numbers: Option<&[u8]>, indices: Option<&[usize]>) -> Vec<bool> {
    (0..geometry.natoms())
        .map(|i| {
            let by_element = numbers.is_none_or(|n| n.contains(&geometry.atoms()[i].number));
            let by_index = indices.is_none_or(|idx| idx.contains(&i));
            by_element && by_index
        })
        .collect()
}

fn zeroed(geometry: &Geometry) -> Geometry {
    let mut zero = geometry.clone();
    if zero.energy.is_some() {
        zero.energy = Some(0.0);
    }
    if zero.formation_energy.is_some() {
        zero.formation_energy = Some(0.0);
    }
    if zero.stress.is_some() {
        zero.stress = Some(Matrix3::zeros());
    }
    for atom in zero.atoms_mut() {
        if atom.has_force() {
            atom.force = Vector3::zeros();
        }
    }
    zero
}

/// Energy used for comparisons: the formation energy when both sides have one.
fn comparable_energies(a: &Geometry, b: &Geometry) -> Option<(f64, f64)> {
    match (a.formation_energy, b.formation_energy) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => Some((a.energy?, b.energy?)),
    }
}

/// Reduces a set of difference rows (each row a vector) into one statistic.
fn reduce(metric: Metric, rows: &[DVector<f64>]) -> f64 {
    match metric {
        Metric::Mae => {
            let (sum, count) = rows.iter().fold((0.0, 0usize), |(s, c), r| {
                (s + r.iter().map(|x| x.abs()).sum::<f64>(), c + r.len())
            });
            sum / count as f64
        }
        Metric::Rmse => {
            let (sum, count) = rows
                .iter()
                .fold((0.0, 0usize), |(s, c), r| (s + r.norm_squared(), c + r.len()));
            (sum / count as f64).sqrt()
        }
        Metric::Max => rows.iter().map(|r| r.norm()).fold(0.0, f64::max),
    }
}

fn row_errors(
    index: usize,
    a: &Geometry,
    b: &Geometry,
    mask: &[bool],
    query: &ErrorQuery,
) -> Result<Vec<f64>, MetricsError> {
    let missing = |property| MetricsError::MissingProperty { index, property };
    query
        .properties
        .iter()
        .map(|&property| {
            let rows: Vec<DVector<f64>> = match property {
                Property::Energy => {
                    let (ea, eb) = comparable_energies(a, b).ok_or_else(|| missing(property))?;
                    let natoms = a.natoms() as f64;
                    vec![DVector::from_element(1, 1000.0 * (ea - eb) / natoms)]
                }
                Property::Forces => {
                    if !a.has_forces() || !b.has_forces() {
                        return Err(missing(property));
                    }
                    a.atoms()
                        .iter()
                        .zip(b.atoms())
                        .zip(mask)
                        .filter(|(_, m)| **m)
                        .map(|((x, y), _)| DVector::from_iterator(3, ((x.force - y.force) * 1000.0).iter().copied()))
                        .collect()
                }
                Property::Stress => {
                    let (sa, sb) = a.stress.zip(b.stress).ok_or_else(|| missing(property))?;
                    let diff = (sa - sb) * EV_PER_A3_TO_MPA;
                    vec![DVector::from_iterator(9, diff.transpose().iter().copied())]
                }
            };
            Ok(reduce(query.metric, &rows))
        })
        .collect()
}

/// Computes per-geometry errors between two aligned sets of geometries.
///
/// When `predicted` is `None` the errors are intrinsic: every geometry is
/// compared against a copy of itself with zeroed energy, forces and stress.
/// Rows for null geometries and geometries without any atom of interest are
/// omitted. Columns follow `query.properties`.
///
/// # Errors
///
/// Returns a [`MetricsError`] for invalid queries, mismatched inputs, missing
/// labels, or when no geometry contributes a row.
pub fn compute_errors(
    reference: &[Geometry],
    predicted: Option<&[Geometry]>,
    query: &ErrorQuery,
) -> Result<DMatrix<f64>, MetricsError> {
    let numbers = query.validate()?;
    let zeroed_copies: Vec<Geometry>;
    let predicted = match predicted {
        Some(p) => p,
        None => {
            zeroed_copies = reference.iter().map(zeroed).collect();
            &zeroed_copies
        }
    };
    if reference.len() != predicted.len() {
        return Err(MetricsError::LengthMismatch(reference.len(), predicted.len()));
    }

    let mut rows = Vec::new();
    for (index, (a, b)) in reference.iter().zip(predicted).enumerate() {
        if a.is_null() || b.is_null() {
            continue;
        }
        if a.numbers() != b.numbers() || a != b {
            return Err(MetricsError::TopologyMismatch { index });
        }
        let mask = atom_mask(a, numbers.as_deref(), query.atom_indices.as_deref());
        if !mask.iter().any(|&m| m) {
            continue;
        }
        rows.push(row_errors(index, a, b, &mask, query)?);
    }

    if rows.is_empty() {
        return Err(MetricsError::NoTargetAtoms);
    }
    let ncols = query.properties.len();
    Ok(DMatrix::from_row_iterator(
        rows.len(),
        ncols,
        rows.into_iter().flatten(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(energy: f64, force: f64) -> Geometry {
        let mut g = Geometry::from_data(
            &[1, 8, 1],
            &[
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(2.0, 0.0, 0.0),
            ],
            Some(Matrix3::identity() * 10.0),
        )
        .unwrap();
        g.energy = Some(energy);
        g.stress = Some(Matrix3::identity() * 0.001);
        for atom in g.atoms_mut() {
            atom.force = Vector3::new(force, 0.0, 0.0);
        }
        g
    }

    #[test]
    fn identical_datasets_have_zero_rmse() {
        let data = vec![labeled(-3.0, 0.1), labeled(-2.0, 0.2)];
        let query = ErrorQuery::new(Metric::Rmse, vec![Property::Energy, Property::Forces]);
        let errors = compute_errors(&data, Some(&data), &query).unwrap();
        assert_eq!(errors.shape(), (2, 2));
        assert!(errors.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn energy_error_is_per_atom_in_millielectronvolt() {
        let a = vec![labeled(-3.0, 0.0)];
        let b = vec![labeled(-3.3, 0.0)];
        let query = ErrorQuery::new(Metric::Mae, vec![Property::Energy]);
        let errors = compute_errors(&a, Some(&b), &query).unwrap();
        assert!((errors[(0, 0)] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn intrinsic_errors_measure_label_magnitude() {
        let data = vec![labeled(-3.0, 0.5)];
        let query = ErrorQuery::new(Metric::Max, vec![Property::Forces, Property::Stress]);
        let errors = compute_errors(&data, None, &query).unwrap();
        assert!((errors[(0, 0)] - 500.0).abs() < 1e-9);
        let expected_stress = (3.0f64).sqrt() * 0.001 * EV_PER_A3_TO_MPA;
        assert!((errors[(0, 1)] - expected_stress).abs() < 1e-6);
    }

    #[test]
    fn formation_energy_is_preferred_when_both_sides_have_it() {
        let mut a = labeled(-3.0, 0.0);
        let mut b = labeled(-3.0, 0.0);
        a.formation_energy = Some(-0.3);
        b.formation_energy = Some(0.0);
        let query = ErrorQuery::new(Metric::Mae, vec![Property::Energy]);
        let errors = compute_errors(&[a], Some(&[b]), &query).unwrap();
        assert!((errors[(0, 0)] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn element_mask_selects_matching_atoms_only() {
        let a = labeled(0.0, 0.0);
        let mut b = labeled(0.0, 0.0);
        b.atoms_mut()[1].force = Vector3::new(0.0, 1.0, 0.0);
        let query =
            ErrorQuery::new(Metric::Max, vec![Property::Forces]).with_elements(vec!["H".into()]);
        let errors = compute_errors(&[a.clone()], Some(&[b.clone()]), &query).unwrap();
        assert_eq!(errors[(0, 0)], 0.0);

        let query =
            ErrorQuery::new(Metric::Max, vec![Property::Forces]).with_elements(vec!["O".into()]);
        let errors = compute_errors(&[a], Some(&[b]), &query).unwrap();
        assert!((errors[(0, 0)] - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn geometries_without_target_atoms_are_skipped_or_rejected() {
        let data = vec![labeled(0.0, 0.0)];
        let query =
            ErrorQuery::new(Metric::Rmse, vec![Property::Forces]).with_elements(vec!["Cu".into()]);
        assert_eq!(
            compute_errors(&data, Some(&data), &query),
            Err(MetricsError::NoTargetAtoms)
        );
    }

    #[test]
    fn masks_are_rejected_for_energy_queries() {
        let query =
            ErrorQuery::new(Metric::Rmse, vec![Property::Energy]).with_atom_indices(vec![0]);
        assert_eq!(query.validate(), Err(MetricsError::MaskRequiresForces));
    }

    #[test]
    fn missing_labels_are_reported_with_index() {
        let a = labeled(0.0, 0.0);
        let mut b = labeled(0.0, 0.0);
        b.stress = None;
        let query = ErrorQuery::new(Metric::Rmse, vec![Property::Stress]);
        assert_eq!(
            compute_errors(&[a], Some(&[b]), &query),
            Err(MetricsError::MissingProperty {
                index: 0,
                property: Property::Stress
            })
        );
    }

    #[test]
    fn null_geometries_do_not_contribute_rows() {
        let data = vec![Geometry::null(), labeled(-1.0, 0.1)];
        let query = ErrorQuery::new(Metric::Rmse, vec![Property::Energy]);
        let errors = compute_errors(&data, Some(&data), &query).unwrap();
        assert_eq!(errors.nrows(), 1);
    }
}
