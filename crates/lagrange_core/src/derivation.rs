//! Equation-of-motion derivation.
//!
//! Turns a [`ModelDefinition`] into the symbolic mass matrix and right-hand side of
//!
//! ```text
//! M(q, qdot) * qddot = Q + dL/dq - C(q, qdot) * qdot
//! ```
//!
//! with `M[i][j] = d2L / dqdot_i dqdot_j` and `C[i][j] = d2L / dqdot_i dq_j`, and
//! compiles both into bytecode [`Evaluator`]s. The evaluators are the only thing the
//! propagator needs at run time; the symbolic layer stays behind.

use crate::equation_engine::{Bytecode, Compiler, Expr, VM};
use crate::error::{ModelError, ModelResult, SimulationError, SimulationResult};
use crate::model::ModelDefinition;
use crate::symbolic::{differentiate, gradient, simplify};
use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationOptions {
    /// Run [`simplify`] over the mass matrix and right-hand side.
    pub simplify: bool,
}

impl Default for DerivationOptions {
    fn default() -> Self {
        Self { simplify: true }
    }
}

/// Symbolic equations of motion of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationsOfMotion {
    dof: usize,
    state_names: Vec<String>,
    constant_names: Vec<String>,
    lagrangian: Expr,
    /// Row-major, `dof * dof`.
    mass_matrix: Vec<Expr>,
    rhs: Vec<Expr>,
    kinetic_energy: Expr,
    potential_energy: Expr,
}

/// Derives the mass matrix and right-hand side of a model.
pub fn derive(model: &ModelDefinition, options: DerivationOptions) -> ModelResult<EquationsOfMotion> {
    let n = model.degrees_of_freedom();
    if n == 0 {
        return Err(ModelError::EmptyModel);
    }
    if model.forces().len() != n {
        return Err(ModelError::dimension_mismatch(
            "generalized forces",
            n,
            model.forces().len(),
        ));
    }

    let positions: Vec<&str> = model.coordinates().iter().map(|c| c.name.as_str()).collect();
    let velocities: Vec<&str> = model
        .coordinates()
        .iter()
        .map(|c| c.velocity.as_str())
        .collect();

    let lagrangian = model.lagrangian();
    info!(dof = n, lagrangian_nodes = lagrangian.size(), "Deriving equations of motion");

    let dl_dq = gradient(&lagrangian, &positions);
    let dl_dqdot = gradient(&lagrangian, &velocities);

    // Upper triangle only; the Hessian is symmetric, so the lower triangle is a copy.
    let mut mass_matrix = vec![Expr::num(0.0); n * n];
    for i in 0..n {
        for j in i..n {
            let entry = differentiate(&dl_dqdot[i], velocities[j]);
            mass_matrix[j * n + i] = entry.clone();
            mass_matrix[i * n + j] = entry;
        }
    }

    let mut rhs = Vec::with_capacity(n);
    for i in 0..n {
        let mut row = model.forces()[i].clone() + dl_dq[i].clone();
        for j in 0..n {
            let cross = differentiate(&dl_dqdot[i], positions[j]);
            if !cross.is_zero() {
                row = row - cross * Expr::var(velocities[j]);
            }
        }
        rhs.push(row);
    }

    if options.simplify {
        mass_matrix = mass_matrix.iter().map(simplify).collect();
        rhs = rhs.iter().map(simplify).collect();
    }

    debug!(
        mass_matrix_nodes = mass_matrix.iter().map(Expr::size).sum::<usize>(),
        rhs_nodes = rhs.iter().map(Expr::size).sum::<usize>(),
        simplified = options.simplify,
        "Derived equations of motion"
    );

    Ok(EquationsOfMotion {
        dof: n,
        state_names: model.state_names(),
        constant_names: model.constant_names(),
        lagrangian,
        mass_matrix,
        rhs,
        kinetic_energy: model.kinetic_energy().clone(),
        potential_energy: model.potential_energy().clone(),
    })
}

impl EquationsOfMotion {
    pub fn dof(&self) -> usize {
        self.dof
    }

    pub fn lagrangian(&self) -> &Expr {
        &self.lagrangian
    }

    /// Entry `(i, j)` of the symbolic mass matrix.
    pub fn mass_matrix(&self, i: usize, j: usize) -> &Expr {
        &self.mass_matrix[i * self.dof + j]
    }

    pub fn rhs(&self) -> &[Expr] {
        &self.rhs
    }

    /// Compiles the symbolic results into numeric evaluators.
    pub fn compile(&self) -> ModelResult<CompiledEquations> {
        let compiler = Compiler::new(&self.state_names, &self.constant_names);
        let n = self.dof;
        let build = |rows: usize, cols: usize, exprs: &[Expr]| -> ModelResult<Evaluator> {
            let entries = exprs
                .iter()
                .map(|e| compiler.compile(e))
                .collect::<ModelResult<Vec<_>>>()?;
            Ok(Evaluator::new(rows, cols, entries, 2 * n, self.constant_names.len() - 1))
        };

        let compiled = CompiledEquations {
            mass_matrix: build(n, n, &self.mass_matrix)?,
            rhs: build(n, 1, &self.rhs)?,
            kinetic_energy: build(1, 1, std::slice::from_ref(&self.kinetic_energy))?,
            potential_energy: build(1, 1, std::slice::from_ref(&self.potential_energy))?,
        };
        debug!(
            mass_matrix_ops = compiled.mass_matrix.op_count(),
            rhs_ops = compiled.rhs.op_count(),
            "Compiled equations of motion"
        );
        Ok(compiled)
    }
}

/// A compiled matrix-valued function `f(state, params, input)`.
///
/// Holds no mutable state; every call evaluates with its own stack, so one
/// evaluator can be shared between threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluator {
    rows: usize,
    cols: usize,
    /// Row-major.
    entries: Vec<Bytecode>,
    state_len: usize,
    param_len: usize,
    stack_capacity: usize,
}

impl Evaluator {
    fn new(
        rows: usize,
        cols: usize,
        entries: Vec<Bytecode>,
        state_len: usize,
        param_len: usize,
    ) -> Self {
        let stack_capacity = entries
            .iter()
            .map(Bytecode::max_stack_depth)
            .max()
            .unwrap_or(0);
        Self {
            rows,
            cols,
            entries,
            state_len,
            param_len,
            stack_capacity,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn op_count(&self) -> usize {
        self.entries.iter().map(|b| b.ops.len()).sum()
    }

    /// Evaluates every entry, row-major.
    pub fn evaluate<T: Scalar>(
        &self,
        state: &[T],
        params: &[T],
        input: T,
    ) -> SimulationResult<Vec<T>> {
        let mut out = vec![T::zero(); self.entries.len()];
        self.evaluate_into(state, params, input, &mut out)?;
        Ok(out)
    }

    pub fn evaluate_into<T: Scalar>(
        &self,
        state: &[T],
        params: &[T],
        input: T,
        out: &mut [T],
    ) -> SimulationResult<()> {
        if state.len() != self.state_len {
            return Err(SimulationError::dimension_mismatch(
                "state",
                self.state_len,
                state.len(),
            ));
        }
        if params.len() != self.param_len {
            return Err(SimulationError::dimension_mismatch(
                "parameters",
                self.param_len,
                params.len(),
            ));
        }
        if out.len() != self.entries.len() {
            return Err(SimulationError::dimension_mismatch(
                "evaluator output",
                self.entries.len(),
                out.len(),
            ));
        }

        let mut constants = Vec::with_capacity(params.len() + 1);
        constants.extend_from_slice(params);
        constants.push(input);

        let mut stack = Vec::with_capacity(self.stack_capacity);
        for (slot, code) in out.iter_mut().zip(&self.entries) {
            *slot = VM::execute(code, state, &constants, &mut stack)?;
        }
        Ok(())
    }

    fn evaluate_scalar(&self, state: &[f64], params: &[f64]) -> SimulationResult<f64> {
        let mut out = [0.0];
        self.evaluate_into(state, params, 0.0, &mut out)?;
        Ok(out[0])
    }
}

/// Numeric evaluators produced by [`EquationsOfMotion::compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledEquations {
    mass_matrix: Evaluator,
    rhs: Evaluator,
    kinetic_energy: Evaluator,
    potential_energy: Evaluator,
}

impl CompiledEquations {
    pub fn dof(&self) -> usize {
        self.mass_matrix.rows
    }

    pub fn parameter_count(&self) -> usize {
        self.mass_matrix.param_len
    }

    /// `(state, params, input) -> M`, row-major.
    pub fn mass_matrix(&self) -> &Evaluator {
        &self.mass_matrix
    }

    /// `(state, params, input) -> Q + dL/dq - C * qdot`.
    pub fn rhs(&self) -> &Evaluator {
        &self.rhs
    }

    pub fn kinetic_energy(&self, state: &[f64], params: &[f64]) -> SimulationResult<f64> {
        self.kinetic_energy.evaluate_scalar(state, params)
    }

    pub fn potential_energy(&self, state: &[f64], params: &[f64]) -> SimulationResult<f64> {
        self.potential_energy.evaluate_scalar(state, params)
    }

    /// Total mechanical energy `T + V`.
    pub fn total_energy(&self, state: &[f64], params: &[f64]) -> SimulationResult<f64> {
        Ok(self.kinetic_energy(state, params)? + self.potential_energy(state, params)?)
    }
}

/// Derives and compiles in one go.
pub fn derive_and_compile(
    model: &ModelDefinition,
    options: DerivationOptions,
) -> ModelResult<CompiledEquations> {
    let equations = derive(model, options)?;
    let compiled = equations.compile()?;
    info!(
        dof = compiled.dof(),
        parameters = compiled.parameter_count(),
        "Equations of motion ready"
    );
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use approx::assert_relative_eq;

    fn pendulum() -> ModelDefinition {
        ModelDefinition::builder()
            .coordinate("phi", "omega")
            .parameters(["m", "l", "g"])
            .input("tau")
            .kinetic_energy("0.5 * m * l^2 * omega^2")
            .potential_energy("-m * g * l * cos(phi)")
            .force("tau")
            .build()
            .unwrap()
    }

    #[test]
    fn pendulum_equations_match_hand_derivation() {
        let equations = derive(&pendulum(), DerivationOptions::default()).unwrap();
        let compiled = equations.compile().unwrap();
        let params = [2.0, 0.5, 9.81];
        let state = [0.3, -1.2];

        let m = compiled.mass_matrix().evaluate(&state, &params, 0.7).unwrap();
        assert_relative_eq!(m[0], 2.0 * 0.25, epsilon = 1e-14);

        let rhs = compiled.rhs().evaluate(&state, &params, 0.7).unwrap();
        assert_relative_eq!(rhs[0], 0.7 - 2.0 * 9.81 * 0.5 * 0.3f64.sin(), epsilon = 1e-12);
    }

    #[test]
    fn cross_terms_use_velocity_partials_differentiated_by_position() {
        // L = 0.5 * (1 + x^2) * xdot^2: M = 1 + x^2, dL/dx = x xdot^2,
        // C = d(dL/dxdot)/dx = 2 x xdot, rhs = x xdot^2 - 2 x xdot^2 = -x xdot^2.
        let model = ModelDefinition::builder()
            .coordinate("x", "xdot")
            .kinetic_energy("0.5 * (1 + x^2) * xdot^2")
            .force("0")
            .build()
            .unwrap();
        let compiled = derive_and_compile(&model, DerivationOptions::default()).unwrap();
        let state = [1.5, 2.0];
        let rhs = compiled.rhs().evaluate(&state, &[], 0.0).unwrap();
        assert_relative_eq!(rhs[0], -1.5 * 4.0, epsilon = 1e-12);
    }

    #[test]
    fn mass_matrix_is_symmetric_by_construction() {
        let model = ModelDefinition::builder()
            .coordinate("a", "adot")
            .coordinate("b", "bdot")
            .kinetic_energy("0.5 * adot^2 + adot * bdot * cos(a - b) + 0.5 * bdot^2")
            .forces(["0", "0"])
            .build()
            .unwrap();
        let equations = derive(&model, DerivationOptions { simplify: false }).unwrap();
        assert_eq!(equations.mass_matrix(0, 1), equations.mass_matrix(1, 0));
        assert_eq!(equations.mass_matrix(0, 1), &simplify(&parse("cos(a - b)").unwrap()));
    }

    #[test]
    fn simplification_does_not_change_values() {
        let model = pendulum();
        let raw = derive_and_compile(&model, DerivationOptions { simplify: false }).unwrap();
        let simple = derive_and_compile(&model, DerivationOptions::default()).unwrap();
        let params = [1.3, 0.8, 9.82];
        let state = [1.1, 0.4];
        let a = raw.rhs().evaluate(&state, &params, -0.2).unwrap();
        let b = simple.rhs().evaluate(&state, &params, -0.2).unwrap();
        assert_relative_eq!(a[0], b[0], epsilon = 1e-12);
    }

    #[test]
    fn evaluators_check_dimensions() {
        let compiled = derive_and_compile(&pendulum(), DerivationOptions::default()).unwrap();
        let err = compiled
            .mass_matrix()
            .evaluate(&[0.0], &[1.0, 1.0, 1.0], 0.0)
            .unwrap_err();
        assert_eq!(err, SimulationError::dimension_mismatch("state", 2, 1));

        let err = compiled
            .rhs()
            .evaluate(&[0.0, 0.0], &[1.0, 1.0], 0.0)
            .unwrap_err();
        assert_eq!(err, SimulationError::dimension_mismatch("parameters", 3, 2));
    }

    #[test]
    fn energy_evaluators() {
        let compiled = derive_and_compile(&pendulum(), DerivationOptions::default()).unwrap();
        let params = [2.0, 0.5, 9.81];
        let state = [0.0, 2.0];
        let kinetic = compiled.kinetic_energy(&state, &params).unwrap();
        let potential = compiled.potential_energy(&state, &params).unwrap();
        assert_relative_eq!(kinetic, 0.5 * 2.0 * 0.25 * 4.0);
        assert_relative_eq!(potential, -2.0 * 9.81 * 0.5);
        assert_relative_eq!(
            compiled.total_energy(&state, &params).unwrap(),
            kinetic + potential
        );
    }
}
