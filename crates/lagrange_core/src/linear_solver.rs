//! Dense solvers for `M * a = b`, the one linear solve per derivative evaluation.
//!
//! All solvers take `M` row-major and report a singular `M` as
//! [`SimulationError::NumericalSingularity`]; none of them fall back to a
//! pseudo-inverse or a perturbed matrix. Singularity is judged row by row, so
//! a matrix like `diag(1e-14, 1)` is solved rather than rejected.

use crate::error::{SimulationError, SimulationResult};
use crate::traits::Scalar;
use nalgebra::{DMatrix, DVector};

/// Pivots at or below this fraction of their row's largest entry count as zero.
const RELATIVE_PIVOT_TOLERANCE: f64 = 1e-13;

pub trait LinearSolver<T: Scalar> {
    /// Solves `matrix * x = rhs` for a `dim x dim` row-major `matrix`.
    fn solve(&self, dim: usize, matrix: &[T], rhs: &[T]) -> SimulationResult<Vec<T>>;
}

fn check_shape<T>(dim: usize, matrix: &[T], rhs: &[T]) -> SimulationResult<()> {
    if matrix.len() != dim * dim {
        return Err(SimulationError::dimension_mismatch(
            "matrix entries",
            dim * dim,
            matrix.len(),
        ));
    }
    if rhs.len() != dim {
        return Err(SimulationError::dimension_mismatch(
            "right-hand side",
            dim,
            rhs.len(),
        ));
    }
    Ok(())
}

/// Largest absolute entry of each row. A zero row makes the matrix singular.
fn row_scales<T: Scalar>(dim: usize, matrix: &[T]) -> SimulationResult<Vec<T>> {
    let mut scales = Vec::with_capacity(dim);
    for (row, values) in matrix.chunks(dim.max(1)).enumerate().take(dim) {
        let mut max = T::zero();
        for &v in values {
            if !v.is_finite() {
                return Err(SimulationError::NonFinite("mass matrix".into()));
            }
            max = max.max(v.abs());
        }
        if max == T::zero() {
            return Err(SimulationError::singular(format!("row {row} is zero")));
        }
        scales.push(max);
    }
    Ok(scales)
}

fn check_solution<T: Scalar>(solution: &[T]) -> SimulationResult<()> {
    if solution.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SimulationError::NonFinite("linear solve".into()))
    }
}

/// Gaussian elimination with partial pivoting. Works for any dimension and any
/// scalar type, dual numbers included.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianElimination;

impl<T: Scalar> LinearSolver<T> for GaussianElimination {
    fn solve(&self, dim: usize, matrix: &[T], rhs: &[T]) -> SimulationResult<Vec<T>> {
        check_shape(dim, matrix, rhs)?;
        let mut scales = row_scales(dim, matrix)?;
        let tolerance = T::lift(RELATIVE_PIVOT_TOLERANCE);

        let mut a = matrix.to_vec();
        let mut b = rhs.to_vec();

        for col in 0..dim {
            // Scaled partial pivoting: compare candidates relative to their rows.
            let pivot_row = (col..dim)
                .max_by(|&r1, &r2| {
                    let v1 = a[r1 * dim + col].abs() / scales[r1];
                    let v2 = a[r2 * dim + col].abs() / scales[r2];
                    v1.partial_cmp(&v2).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(col);
            let pivot = a[pivot_row * dim + col];
            if pivot.abs() <= tolerance * scales[pivot_row] {
                return Err(SimulationError::singular(format!(
                    "zero pivot in column {col}"
                )));
            }
            if pivot_row != col {
                for k in 0..dim {
                    a.swap(col * dim + k, pivot_row * dim + k);
                }
                b.swap(col, pivot_row);
                scales.swap(col, pivot_row);
            }

            for row in (col + 1)..dim {
                let factor = a[row * dim + col] / pivot;
                a[row * dim + col] = T::zero();
                for k in (col + 1)..dim {
                    a[row * dim + k] = a[row * dim + k] - factor * a[col * dim + k];
                }
                b[row] = b[row] - factor * b[col];
            }
        }

        let mut x = vec![T::zero(); dim];
        for row in (0..dim).rev() {
            let mut sum = b[row];
            for k in (row + 1)..dim {
                sum = sum - a[row * dim + k] * x[k];
            }
            x[row] = sum / a[row * dim + row];
        }

        check_solution(&x)?;
        Ok(x)
    }
}

/// Closed-form inverse for two coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cramer2;

impl<T: Scalar> LinearSolver<T> for Cramer2 {
    fn solve(&self, dim: usize, matrix: &[T], rhs: &[T]) -> SimulationResult<Vec<T>> {
        if dim != 2 {
            return Err(SimulationError::dimension_mismatch("Cramer2 dimension", 2, dim));
        }
        check_shape(dim, matrix, rhs)?;
        let scales = row_scales(dim, matrix)?;
        let (a, b, c, d) = (matrix[0], matrix[1], matrix[2], matrix[3]);
        let det = a * d - b * c;
        if det.abs() <= scales[0] * scales[1] * T::lift(RELATIVE_PIVOT_TOLERANCE) {
            return Err(SimulationError::singular("determinant is zero"));
        }
        let x = vec![(d * rhs[0] - b * rhs[1]) / det, (a * rhs[1] - c * rhs[0]) / det];
        check_solution(&x)?;
        Ok(x)
    }
}

/// LU decomposition with partial pivoting from nalgebra (f64 only).
#[derive(Debug, Clone, Copy, Default)]
pub struct NalgebraLu;

impl LinearSolver<f64> for NalgebraLu {
    fn solve(&self, dim: usize, matrix: &[f64], rhs: &[f64]) -> SimulationResult<Vec<f64>> {
        check_shape(dim, matrix, rhs)?;
        let scales = row_scales(dim, matrix)?;
        // Row equilibration leaves the solution unchanged and puts every row on
        // a unit scale, so one absolute pivot threshold fits all rows.
        let mut m = DMatrix::from_row_slice(dim, dim, matrix);
        let mut b = DVector::from_column_slice(rhs);
        for (i, scale) in scales.iter().enumerate() {
            m.row_mut(i).scale_mut(1.0 / scale);
            b[i] /= scale;
        }
        let lu = m.lu();
        let u = lu.u();
        if (0..dim).any(|i| u[(i, i)].abs() <= RELATIVE_PIVOT_TOLERANCE) {
            return Err(SimulationError::singular("LU factor has a zero pivot"));
        }
        let x: Vec<f64> = lu
            .solve(&b)
            .ok_or_else(|| SimulationError::singular("LU solve failed"))?
            .iter()
            .copied()
            .collect();
        check_solution(&x)?;
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;
    use approx::assert_relative_eq;

    const M: [f64; 9] = [4.0, -2.0, 1.0, -2.0, 4.0, -2.0, 1.0, -2.0, 3.0];
    const B: [f64; 3] = [11.0, -16.0, 17.0];

    fn residual(x: &[f64]) -> f64 {
        (0..3)
            .map(|i| ((0..3).map(|j| M[i * 3 + j] * x[j]).sum::<f64>() - B[i]).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn gaussian_and_lu_agree() {
        let g = GaussianElimination.solve(3, &M, &B).unwrap();
        let l = NalgebraLu.solve(3, &M, &B).unwrap();
        assert!(residual(&g) < 1e-12);
        for i in 0..3 {
            assert_relative_eq!(g[i], l[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn gaussian_pivots_past_zero_diagonal() {
        let m = [0.0, 1.0, 1.0, 0.0];
        let x = GaussianElimination.solve(2, &m, &[3.0, 5.0]).unwrap();
        assert_eq!(x, vec![5.0, 3.0]);
    }

    #[test]
    fn cramer_matches_gaussian_for_two_by_two() {
        let m = [14.0, -1.5, -1.5, 1.975];
        let b = [-2.0, 7.5];
        let c = Cramer2.solve(2, &m, &b).unwrap();
        let g = GaussianElimination.solve(2, &m, &b).unwrap();
        assert_relative_eq!(c[0], g[0], epsilon = 1e-14);
        assert_relative_eq!(c[1], g[1], epsilon = 1e-14);
    }

    #[test]
    fn cramer_rejects_other_dimensions() {
        assert!(matches!(
            Cramer2.solve(3, &M, &B),
            Err(SimulationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn singular_matrices_are_reported() {
        let singular = [0.0, 0.0, 0.0, 1.0];
        let rhs = [1.0, 1.0];
        for result in [
            GaussianElimination.solve(2, &singular, &rhs),
            Cramer2.solve(2, &singular, &rhs),
            NalgebraLu.solve(2, &singular, &rhs),
        ] {
            assert!(matches!(result, Err(SimulationError::NumericalSingularity(_))));
        }

        let zero = [0.0; 4];
        assert!(matches!(
            GaussianElimination.solve(2, &zero, &rhs),
            Err(SimulationError::NumericalSingularity(_))
        ));
    }

    #[test]
    fn badly_scaled_diagonal_is_not_singular() {
        let m = [1e-14, 0.0, 0.0, 1.0];
        let b = [2e-14, 3.0];
        for x in [
            GaussianElimination.solve(2, &m, &b).unwrap(),
            Cramer2.solve(2, &m, &b).unwrap(),
            NalgebraLu.solve(2, &m, &b).unwrap(),
        ] {
            assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
            assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn rank_deficient_rows_are_singular() {
        let m = [1.0, 2.0, 2.0, 4.0];
        let rhs = [1.0, 1.0];
        for result in [
            GaussianElimination.solve(2, &m, &rhs),
            Cramer2.solve(2, &m, &rhs),
            NalgebraLu.solve(2, &m, &rhs),
        ] {
            assert!(matches!(result, Err(SimulationError::NumericalSingularity(_))));
        }
    }

    #[test]
    fn non_finite_entries_are_reported() {
        let m = [f64::NAN, 0.0, 0.0, 1.0];
        assert!(matches!(
            GaussianElimination.solve(2, &m, &[1.0, 1.0]),
            Err(SimulationError::NonFinite(_))
        ));
    }

    #[test]
    fn gaussian_propagates_dual_parts() {
        // d/ds of (s * I)^-1 b at s = 2 is -b / s^2.
        let m = [Dual::new(2.0, 1.0), Dual::new(0.0, 0.0), Dual::new(0.0, 0.0), Dual::new(2.0, 1.0)];
        let b = [Dual::new(4.0, 0.0), Dual::new(-6.0, 0.0)];
        let x = GaussianElimination.solve(2, &m, &b).unwrap();
        assert_relative_eq!(x[0].val, 2.0);
        assert_relative_eq!(x[0].eps, -1.0);
        assert_relative_eq!(x[1].val, -3.0);
        assert_relative_eq!(x[1].eps, 1.5);
    }
}
