use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

const DEGENERATE_TOLERANCE: f64 = 1e-12;
const TRIANGULAR_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CellError {
    #[error("Cell matrix is degenerate (|det| = {determinant:.3e})")]
    Degenerate { determinant: f64 },
    #[error("Cell matrix must be lower triangular before box reduction")]
    NotLowerTriangular,
}

/// Returns `true` when all three lattice vectors are zero, i.e. the system is non-periodic.
pub fn is_zero(cell: &Matrix3<f64>) -> bool {
    cell.iter().all(|&x| x == 0.0)
}

/// Returns `true` if the cell (rows are lattice vectors) is lower triangular
/// with a strictly positive diagonal.
pub fn is_lower_triangular(cell: &Matrix3<f64>) -> bool {
    cell[(0, 0)] > 0.0
        && cell[(1, 1)] > 0.0
        && cell[(2, 2)] > 0.0
        && cell[(0, 1)].abs() < TRIANGULAR_TOLERANCE
        && cell[(0, 2)].abs() < TRIANGULAR_TOLERANCE
        && cell[(1, 2)].abs() < TRIANGULAR_TOLERANCE
}

/// Returns `true` if the cell is lower triangular and every off-diagonal
/// component is at most half the diagonal component it is reduced against.
pub fn is_reduced(cell: &Matrix3<f64>) -> bool {
    let tol = TRIANGULAR_TOLERANCE;
    is_lower_triangular(cell)
        && cell[(0, 0)] + tol >= 2.0 * cell[(1, 0)].abs()
        && cell[(0, 0)] + tol >= 2.0 * cell[(2, 0)].abs()
        && cell[(1, 1)] + tol >= 2.0 * cell[(2, 1)].abs()
}

/// Rotates (and if needed reflects) the coordinate frame so that the cell becomes
/// lower triangular with a positive diagonal.
///
/// The transform is derived from the QR decomposition of the transposed cell and
/// applied in place to both the lattice vectors and the atomic positions. Box
/// vector lengths and angles are unchanged.
///
/// # Errors
///
/// Returns [`CellError::Degenerate`] if the lattice vectors are linearly dependent.
pub fn transform_lower_triangular(
    positions: &mut [Vector3<f64>],
    cell: &mut Matrix3<f64>,
) -> Result<(), CellError> {
    let determinant = cell.determinant();
    if determinant.abs() < DEGENERATE_TOLERANCE {
        return Err(CellError::Degenerate { determinant });
    }

    let qr = cell.transpose().qr();
    let q = qr.q();
    let r = qr.r();
    let mut flip = Matrix3::identity();
    for i in 0..3 {
        if r[(i, i)].abs() < DEGENERATE_TOLERANCE {
            return Err(CellError::Degenerate { determinant });
        }
        flip[(i, i)] = r[(i, i)].signum();
    }
    let rotation = q * flip;

    *cell *= rotation;
    let rotation_t = rotation.transpose();
    for position in positions.iter_mut() {
        *position = rotation_t * *position;
    }

    cell[(0, 1)] = 0.0;
    cell[(0, 2)] = 0.0;
    cell[(1, 2)] = 0.0;
    Ok(())
}

/// Replaces the second and third lattice vectors by the shortest equivalent
/// linear combinations so that `b` lies mostly along y and `c` mostly along z.
///
/// # Errors
///
/// Returns [`CellError::NotLowerTriangular`] if the cell has not been
/// canonicalized with [`transform_lower_triangular`] first.
pub fn reduce_box_vectors(cell: &mut Matrix3<f64>) -> Result<(), CellError> {
    if !is_lower_triangular(cell) {
        return Err(CellError::NotLowerTriangular);
    }
    let a = cell.row(0).into_owned();
    let b = cell.row(1).into_owned();

    let c = cell.row(2) - b * (cell[(2, 1)] / cell[(1, 1)]).round();
    cell.set_row(2, &c);
    let c = cell.row(2) - a * (cell[(2, 0)] / cell[(0, 0)]).round();
    cell.set_row(2, &c);
    let b = cell.row(1) - a * (cell[(1, 0)] / cell[(0, 0)]).round();
    cell.set_row(1, &b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skewed_cell() -> Matrix3<f64> {
        Matrix3::new(
            4.0, 0.5, -0.3, //
            1.2, 5.0, 0.7, //
            -0.4, 2.9, 6.0,
        )
    }

    #[test]
    fn transform_produces_lower_triangular_cell_with_same_volume() {
        let mut cell = skewed_cell();
        let volume = cell.determinant().abs();
        let mut positions = vec![Vector3::new(1.0, 2.0, 3.0)];
        transform_lower_triangular(&mut positions, &mut cell).unwrap();

        assert!(is_lower_triangular(&cell));
        assert!((cell.determinant() - volume).abs() < 1e-5);
    }

    #[test]
    fn transform_preserves_fractional_coordinates() {
        let mut cell = skewed_cell();
        let position = Vector3::new(1.0, 2.0, 3.0);
        let fractional = cell.transpose().try_inverse().unwrap() * position;
        let mut positions = vec![position];
        transform_lower_triangular(&mut positions, &mut cell).unwrap();

        let after = cell.transpose().try_inverse().unwrap() * positions[0];
        assert!((fractional - after).norm() < 1e-8);
    }

    #[test]
    fn transform_rejects_degenerate_cells() {
        let mut cell = Matrix3::new(1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let result = transform_lower_triangular(&mut [], &mut cell);
        assert!(matches!(result, Err(CellError::Degenerate { .. })));
    }

    #[test]
    fn reduction_requires_lower_triangular_input() {
        let mut cell = skewed_cell();
        assert_eq!(
            reduce_box_vectors(&mut cell),
            Err(CellError::NotLowerTriangular)
        );
    }

    #[test]
    fn reduction_shortens_tilted_vectors() {
        let mut cell = Matrix3::new(
            3.0, 0.0, 0.0, //
            4.0, 3.0, 0.0, //
            -5.0, 7.0, 3.0,
        );
        let volume = cell.determinant();
        reduce_box_vectors(&mut cell).unwrap();

        assert!(is_reduced(&cell));
        assert!((cell.determinant() - volume).abs() < 1e-10);
    }
}
