//! Error types for model definition, derivation and simulation.

use thiserror::Error;

/// Result type alias for model definition and derivation.
pub type ModelResult<T> = Result<T, ModelError>;

/// Result type alias for numerical evaluation and simulation.
pub type SimulationResult<T> = Result<T, SimulationError>;

/// Configuration errors. Detected while a model is defined, derived or compiled,
/// and fatal: the model definition has to be corrected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// An expression could not be parsed.
    #[error("failed to parse \"{expression}\": {message}")]
    Parse { expression: String, message: String },

    /// An expression references a name the model does not declare.
    #[error("unknown symbol \"{symbol}\" in {context}")]
    UnknownSymbol { symbol: String, context: String },

    /// A name is declared more than once.
    #[error("symbol \"{0}\" is declared more than once")]
    DuplicateSymbol(String),

    /// Two sequences that must have equal length do not.
    #[error("{what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// The external input appears in an energy expression.
    #[error("input \"{0}\" may only appear in generalized forces")]
    InputInEnergy(String),

    /// The model has no generalized coordinates.
    #[error("model has no generalized coordinates")]
    EmptyModel,
}

impl ModelError {
    /// Create a dimension mismatch error.
    #[must_use]
    pub fn dimension_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Create an unknown symbol error.
    #[must_use]
    pub fn unknown_symbol(symbol: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownSymbol {
            symbol: symbol.into(),
            context: context.into(),
        }
    }
}

/// Numerical errors raised while evaluating or integrating a model. Fatal to the
/// current run; nothing in this crate retries after one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    /// The mass matrix could not be factorized.
    #[error("numerical singularity: {0}")]
    NumericalSingularity(String),

    /// An evaluation produced NaN or an infinite value.
    #[error("non-finite value in {0}")]
    NonFinite(String),

    /// A state, parameter or buffer slice has the wrong length.
    #[error("{what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Simulation settings are unusable.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// The adaptive integrator could not satisfy its tolerances.
    #[error("step size {dt:e} fell below the minimum at t = {t}")]
    StepSizeUnderflow { t: f64, dt: f64 },

    /// The integrator exhausted its step budget.
    #[error("exceeded {0} integration steps")]
    MaxStepsExceeded(usize),

    /// Bytecode left the VM stack in an inconsistent state.
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
}

impl SimulationError {
    /// Create a dimension mismatch error.
    #[must_use]
    pub fn dimension_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Create a singularity error.
    #[must_use]
    pub fn singular(details: impl Into<String>) -> Self {
        Self::NumericalSingularity(details.into())
    }

    /// Create an invalid settings error.
    #[must_use]
    pub fn invalid_settings(details: impl Into<String>) -> Self {
        Self::InvalidSettings(details.into())
    }
}
