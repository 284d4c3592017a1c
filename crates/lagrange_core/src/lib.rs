/// The `lagrange_core` crate derives equations of motion from a Lagrangian and
/// integrates them. Everything numeric is generic over `Scalar`, so the same
/// evaluators run on `f64` and on dual numbers for Jacobians.
///
/// Key components:
/// - **Model**: `ModelDefinition` (coordinates, parameters, input, energies, forces) and ready-made `models`.
/// - **Derivation**: symbolic calculus on `Expr` trees producing the mass matrix and right-hand side.
/// - **Equation Engine**: parser, compiler and bytecode VM behind the compiled evaluators.
/// - **Propagator**: `LagrangianSystem`, the `f(t, y)` vector field solving `M * qddot = rhs`.
/// - **Solvers / Simulation**: Euler, RK4, Tsit5 (fixed and adaptive) and the sampling driver.
/// - **Equilibrium**: Newton search, dual-number Jacobians and eigenvalue classification.
pub mod autodiff;
pub mod derivation;
pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod linear_solver;
pub mod model;
pub mod models;
pub mod propagator;
pub mod simulation;
pub mod solvers;
pub mod symbolic;
pub mod traits;

pub use derivation::{derive, derive_and_compile, CompiledEquations, DerivationOptions, EquationsOfMotion};
pub use error::{ModelError, SimulationError};
pub use model::{GeneralizedCoordinate, ModelDefinition};
pub use propagator::LagrangianSystem;
pub use simulation::{simulate, IntegratorMethod, SimulationSettings, Trajectory};
