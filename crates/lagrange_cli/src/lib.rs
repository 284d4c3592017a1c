//! Library side of the `lagrange` binary: configuration loading and run orchestration.

pub mod config;
pub mod run;

pub use config::{ModelConfig, RunConfig};
pub use run::{build_system, find_equilibrium, run, Frame, RunOutput};
