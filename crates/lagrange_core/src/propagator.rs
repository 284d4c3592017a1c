//! Numerical state propagation for derived Lagrangian models.
//!
//! [`LagrangianSystem`] binds parameter values and an external input to compiled
//! equations and exposes the first-order vector field
//! `d/dt [q, qdot] = [qdot, M^-1 * rhs]` through [`DynamicalSystem`]. It is a pure
//! derivative evaluator; stepping is left to the solvers.

use crate::autodiff::lift_all;
use crate::derivation::CompiledEquations;
use crate::error::{ModelError, ModelResult, SimulationError, SimulationResult};
use crate::linear_solver::{GaussianElimination, LinearSolver};
use crate::traits::{DynamicalSystem, Scalar};
use std::sync::Arc;

/// Vector field of a derived model with bound parameters.
#[derive(Debug, Clone)]
pub struct LagrangianSystem<S = GaussianElimination> {
    equations: Arc<CompiledEquations>,
    params: Vec<f64>,
    input: f64,
    solver: S,
}

impl LagrangianSystem<GaussianElimination> {
    /// Binds `params` (in declaration order) to the equations. The input starts at 0.
    pub fn new(equations: Arc<CompiledEquations>, params: Vec<f64>) -> ModelResult<Self> {
        if params.len() != equations.parameter_count() {
            return Err(ModelError::dimension_mismatch(
                "parameter values",
                equations.parameter_count(),
                params.len(),
            ));
        }
        Ok(Self {
            equations,
            params,
            input: 0.0,
            solver: GaussianElimination,
        })
    }
}

impl<S> LagrangianSystem<S> {
    /// Replaces the linear solver used for `M * qddot = rhs`.
    pub fn with_solver<R>(self, solver: R) -> LagrangianSystem<R> {
        LagrangianSystem {
            equations: self.equations,
            params: self.params,
            input: self.input,
            solver,
        }
    }

    /// Sets the external input (e.g. a torque) held constant over the run.
    pub fn with_input(mut self, input: f64) -> Self {
        self.input = input;
        self
    }

    pub fn equations(&self) -> &Arc<CompiledEquations> {
        &self.equations
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn input(&self) -> f64 {
        self.input
    }

    pub fn dof(&self) -> usize {
        self.equations.dof()
    }

    /// Generalized accelerations at `state = [q, qdot]`.
    pub fn accelerations<T: Scalar>(&self, state: &[T]) -> SimulationResult<Vec<T>>
    where
        S: LinearSolver<T>,
    {
        let n = self.dof();
        if state.len() != 2 * n {
            return Err(SimulationError::dimension_mismatch("state", 2 * n, state.len()));
        }
        let params: Vec<T> = lift_all(&self.params);
        let input = T::lift(self.input);

        let mass = self.equations.mass_matrix().evaluate(state, &params, input)?;
        let rhs = self.equations.rhs().evaluate(state, &params, input)?;
        if rhs.iter().any(|v| !v.is_finite()) {
            return Err(SimulationError::NonFinite("right-hand side".into()));
        }
        self.solver.solve(n, &mass, &rhs)
    }

    /// Total mechanical energy `T + V` at `state`.
    pub fn total_energy(&self, state: &[f64]) -> SimulationResult<f64> {
        self.equations.total_energy(state, &self.params)
    }
}

impl<T: Scalar, S: LinearSolver<T>> DynamicalSystem<T> for LagrangianSystem<S> {
    fn dimension(&self) -> usize {
        2 * self.dof()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) -> SimulationResult<()> {
        let n = self.dof();
        if out.len() != 2 * n {
            return Err(SimulationError::dimension_mismatch("derivative buffer", 2 * n, out.len()));
        }
        let accelerations = self.accelerations(x)?;
        out[..n].copy_from_slice(&x[n..]);
        out[n..].copy_from_slice(&accelerations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{derive_and_compile, DerivationOptions};
    use crate::linear_solver::{Cramer2, NalgebraLu};
    use crate::model::ModelDefinition;
    use approx::assert_relative_eq;

    /// Two independent oscillators; the input only drives the first.
    fn decoupled() -> Arc<CompiledEquations> {
        let model = ModelDefinition::builder()
            .coordinate("x", "xdot")
            .coordinate("y", "ydot")
            .parameters(["m1", "m2", "k1", "k2"])
            .input("F")
            .kinetic_energy("0.5 * m1 * xdot^2 + 0.5 * m2 * ydot^2")
            .potential_energy("0.5 * k1 * x^2 + 0.5 * k2 * y^2")
            .forces(["F", "0"])
            .build()
            .unwrap();
        Arc::new(derive_and_compile(&model, DerivationOptions::default()).unwrap())
    }

    #[test]
    fn diagonal_mass_matrix_divides_elementwise() {
        let params = vec![2.0, 5.0, 3.0, 7.0];
        let system = LagrangianSystem::new(decoupled(), params.clone())
            .unwrap()
            .with_input(1.5);
        let state = [0.4, -0.2, 1.0, 2.0];

        let rhs = system
            .equations()
            .rhs()
            .evaluate(&state, &params, 1.5)
            .unwrap();
        let acc = system.accelerations(&state).unwrap();
        assert_relative_eq!(acc[0], rhs[0] / 2.0, epsilon = 1e-14);
        assert_relative_eq!(acc[1], rhs[1] / 5.0, epsilon = 1e-14);
        assert_relative_eq!(acc[0], (1.5 - 3.0 * 0.4) / 2.0, epsilon = 1e-14);
        assert_relative_eq!(acc[1], 7.0 * 0.2 / 5.0, epsilon = 1e-14);
    }

    #[test]
    fn derivative_has_twice_the_coordinate_count() {
        let system = LagrangianSystem::new(decoupled(), vec![1.0; 4]).unwrap();
        assert_eq!(DynamicalSystem::<f64>::dimension(&system), 4);

        let state = [0.1, 0.2, 0.3, 0.4];
        let mut out = [0.0; 4];
        system.apply(0.0, &state, &mut out).unwrap();
        assert_eq!(&out[..2], &state[2..]);

        let mut short = [0.0; 3];
        assert!(system.apply(0.0, &state, &mut short).is_err());
        assert!(system.apply(0.0, &state[..3], &mut out).is_err());
    }

    #[test]
    fn parameter_count_is_checked_when_binding() {
        let err = LagrangianSystem::new(decoupled(), vec![1.0; 3]).unwrap_err();
        assert_eq!(err, ModelError::dimension_mismatch("parameter values", 4, 3));
    }

    #[test]
    fn zero_mass_is_a_numerical_singularity() {
        let system = LagrangianSystem::new(decoupled(), vec![0.0, 1.0, 1.0, 1.0]).unwrap();
        let err = system.accelerations(&[0.1, 0.1, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, SimulationError::NumericalSingularity(_)));
    }

    #[test]
    fn widely_spread_masses_still_solve() {
        let system = LagrangianSystem::new(decoupled(), vec![1e-14, 1.0, 1.0, 1.0])
            .unwrap()
            .with_input(1e-14);
        let acc = system.accelerations(&[0.0, 0.5, 0.0, 0.0]).unwrap();
        assert_relative_eq!(acc[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(acc[1], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn solvers_are_interchangeable() {
        let params = vec![2.0, 5.0, 3.0, 7.0];
        let state = [0.4, -0.2, 1.0, 2.0];
        let base = LagrangianSystem::new(decoupled(), params).unwrap().with_input(0.3);
        let reference = base.accelerations(&state).unwrap();
        let cramer = base.clone().with_solver(Cramer2).accelerations(&state).unwrap();
        let lu = base.with_solver(NalgebraLu).accelerations(&state).unwrap();
        for i in 0..2 {
            assert_relative_eq!(cramer[i], reference[i], epsilon = 1e-14);
            assert_relative_eq!(lu[i], reference[i], epsilon = 1e-14);
        }
    }

    #[test]
    fn repeated_evaluation_is_deterministic() {
        let system = LagrangianSystem::new(decoupled(), vec![2.0, 5.0, 3.0, 7.0]).unwrap();
        let state = [0.4, -0.2, 1.0, 2.0];
        let first = system.accelerations(&state).unwrap();
        for _ in 0..10 {
            assert_eq!(system.accelerations(&state).unwrap(), first);
        }
    }

    #[test]
    fn compiled_equations_are_shared_across_threads() {
        let equations = decoupled();
        let stiffnesses = [1.0, 4.0, 9.0, 16.0];
        let results: Vec<f64> = std::thread::scope(|scope| {
            let handles: Vec<_> = stiffnesses
                .iter()
                .map(|&k| {
                    let equations = Arc::clone(&equations);
                    scope.spawn(move || {
                        let system =
                            LagrangianSystem::new(equations, vec![1.0, 1.0, k, 1.0]).unwrap();
                        system.accelerations(&[1.0, 0.0, 0.0, 0.0]).unwrap()[0]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![-1.0, -4.0, -9.0, -16.0]);
    }
}
