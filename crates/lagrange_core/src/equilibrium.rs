//! Equilibria and local stability of first-order systems.
//!
//! Jacobians come from dual-number sweeps through the same vector field the
//! integrators use, so for a [`crate::propagator::LagrangianSystem`] they include
//! the derivative of the mass-matrix solve.

use crate::autodiff::{jacobian, Dual};
use crate::error::{SimulationError, SimulationResult};
use crate::linear_solver::{LinearSolver, NalgebraLu};
use crate::traits::{DynamicalSystem, Scalar};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::linalg::SVD;
use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexNumber {
    pub re: f64,
    pub im: f64,
}

impl From<Complex<f64>> for ComplexNumber {
    fn from(value: Complex<f64>) -> Self {
        Self {
            re: value.re,
            im: value.im,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: ComplexNumber,
    pub vector: Vec<ComplexNumber>,
}

/// Local type of an equilibrium, read off the Jacobian spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquilibriumKind {
    StableNode,
    StableFocus,
    UnstableNode,
    UnstableFocus,
    Saddle,
    /// Purely imaginary, nonzero spectrum.
    Center,
    /// Some eigenvalue on the imaginary axis, so linearization is inconclusive.
    NonHyperbolic,
}

impl EquilibriumKind {
    pub fn is_stable(self) -> bool {
        matches!(self, Self::StableNode | Self::StableFocus)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linearization {
    /// Row-major Jacobian at the linearization point.
    pub jacobian: Vec<f64>,
    pub eigenpairs: Vec<EigenPair>,
    pub kind: EquilibriumKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumResult {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    pub linearization: Linearization,
}

/// Real parts within this distance of zero count as on the imaginary axis.
const AXIS_TOLERANCE: f64 = 1e-9;

/// Newton iteration on `f(x) = 0`, followed by a linearization at the root.
pub fn solve_equilibrium<S>(
    system: &S,
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<EquilibriumResult>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual> + ?Sized,
{
    let dim = DynamicalSystem::<f64>::dimension(system);
    if dim == 0 {
        bail!("System has zero dimension.");
    }
    if initial_guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            initial_guess.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let mut state = initial_guess.to_vec();
    let mut residual = vec![0.0; dim];
    DynamicalSystem::<f64>::apply(system, 0.0, &state, &mut residual)?;
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    while residual_norm > settings.tolerance {
        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let jac = jacobian(system, 0.0, &state)?;
        let delta = NalgebraLu
            .solve(dim, &jac, &residual)
            .context("Failed to solve linear system during Newton iteration.")?;
        for (x, dx) in state.iter_mut().zip(&delta) {
            *x -= settings.damping * dx;
        }

        iterations += 1;
        DynamicalSystem::<f64>::apply(system, 0.0, &state, &mut residual)?;
        residual_norm = l2_norm(&residual);
        debug!(iterations, residual_norm, "Newton step");
    }

    let linearization = linearize(system, &state)?;
    Ok(EquilibriumResult {
        state,
        residual_norm,
        iterations,
        linearization,
    })
}

/// Jacobian, eigenpairs and classification at `state`. The point need not be an
/// equilibrium, but the classification only means something if it is.
pub fn linearize<S>(system: &S, state: &[f64]) -> Result<Linearization>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let dim = system.dimension();
    let jacobian = jacobian(system, 0.0, state)?;
    let eigenpairs = compute_eigenpairs(dim, &jacobian)
        .context("Failed to compute eigenvalues/eigenvectors of Jacobian.")?;
    let kind = classify(&eigenpairs);
    Ok(Linearization {
        jacobian,
        eigenpairs,
        kind,
    })
}

pub fn compute_eigenpairs(dim: usize, jacobian: &[f64]) -> Result<Vec<EigenPair>> {
    if jacobian.len() != dim * dim {
        bail!(
            "Jacobian has {} entries, expected {}.",
            jacobian.len(),
            dim * dim
        );
    }
    let matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for idx in 0..dim {
        let lambda = eigenvalues[idx];

        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        // The right singular vector of the smallest singular value spans the
        // (numerical) kernel of A - lambda I.
        let svd = SVD::new(shifted, true, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| anyhow!("Failed to compute eigenvector for eigenvalue index {}", idx))?;
        let smallest = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut vector: Vec<Complex<f64>> =
            v_t.row(smallest).iter().map(|c| c.conj()).collect();
        normalize_complex_vector(&mut vector);

        pairs.push(EigenPair {
            value: ComplexNumber::from(lambda),
            vector: vector.into_iter().map(ComplexNumber::from).collect(),
        });
    }
    Ok(pairs)
}

pub fn classify(eigenpairs: &[EigenPair]) -> EquilibriumKind {
    let values: Vec<ComplexNumber> = eigenpairs.iter().map(|p| p.value).collect();
    let on_axis = values.iter().filter(|v| v.re.abs() <= AXIS_TOLERANCE).count();
    let positive = values.iter().filter(|v| v.re > AXIS_TOLERANCE).count();
    let negative = values.iter().filter(|v| v.re < -AXIS_TOLERANCE).count();
    let oscillatory = values.iter().any(|v| v.im.abs() > AXIS_TOLERANCE);

    if positive > 0 && negative > 0 {
        return EquilibriumKind::Saddle;
    }
    if on_axis > 0 {
        let all_nonzero_imaginary = on_axis == values.len()
            && values.iter().all(|v| v.im.abs() > AXIS_TOLERANCE);
        return if all_nonzero_imaginary {
            EquilibriumKind::Center
        } else {
            EquilibriumKind::NonHyperbolic
        };
    }
    match (negative > 0, oscillatory) {
        (true, false) => EquilibriumKind::StableNode,
        (true, true) => EquilibriumKind::StableFocus,
        (false, false) => EquilibriumKind::UnstableNode,
        (false, true) => EquilibriumKind::UnstableFocus,
    }
}

/// `dx/dt = A x` for a constant matrix, e.g. a Jacobian from [`linearize`].
#[derive(Debug, Clone)]
pub struct LinearFlow {
    matrix: DMatrix<f64>,
}

impl LinearFlow {
    pub fn new(dim: usize, row_major: &[f64]) -> SimulationResult<Self> {
        if row_major.len() != dim * dim {
            return Err(SimulationError::dimension_mismatch(
                "matrix entries",
                dim * dim,
                row_major.len(),
            ));
        }
        Ok(Self {
            matrix: DMatrix::from_row_slice(dim, dim, row_major),
        })
    }

    pub fn from_linearization(linearization: &Linearization) -> SimulationResult<Self> {
        let dim = (linearization.jacobian.len() as f64).sqrt().round() as usize;
        Self::new(dim, &linearization.jacobian)
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}

impl<T: Scalar> DynamicalSystem<T> for LinearFlow {
    fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) -> SimulationResult<()> {
        let n = self.matrix.nrows();
        if x.len() != n {
            return Err(SimulationError::dimension_mismatch("state", n, x.len()));
        }
        if out.len() != n {
            return Err(SimulationError::dimension_mismatch("derivative buffer", n, out.len()));
        }
        for (i, slot) in out.iter_mut().enumerate() {
            let mut sum = T::zero();
            for (j, &xj) in x.iter().enumerate() {
                sum = sum + T::lift(self.matrix[(i, j)]) * xj;
            }
            *slot = sum;
        }
        Ok(())
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn normalize_complex_vector(vec: &mut [Complex<f64>]) {
    let norm = vec.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in vec {
            *entry /= norm;
        }
    }
}
