//! Builds the configured model, integrates it and shapes the output.

use crate::config::{ModelConfig, RunConfig};
use anyhow::{Context, Result};
use lagrange_core::equilibrium::{solve_equilibrium, EquilibriumResult, NewtonSettings};
use lagrange_core::models::{
    ball_and_beam, ball_centre, beam_endpoints, damped_oscillator,
};
use lagrange_core::{
    derive_and_compile, simulate, DerivationOptions, LagrangianSystem, ModelDefinition, Trajectory,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Ball and beam drawing data for one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub t: f64,
    pub ball: [f64; 2],
    pub beam: [[f64; 2]; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub model: String,
    pub state_names: Vec<String>,
    pub trajectory: Trajectory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<Frame>>,
}

impl RunOutput {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize run output.")
    }

    pub fn to_csv(&self) -> String {
        self.trajectory.to_csv(&self.state_names)
    }
}

/// Derives and compiles the configured model and binds its parameters and input.
pub fn build_system(config: &RunConfig) -> Result<(ModelDefinition, LagrangianSystem)> {
    let (model, params) = match config.model {
        ModelConfig::BallAndBeam { params, .. } => (ball_and_beam()?, params.to_vec()),
        ModelConfig::Oscillator { params } => (damped_oscillator()?, params.to_vec()),
    };
    let equations = derive_and_compile(&model, DerivationOptions::default())
        .with_context(|| format!("Failed to derive equations for {}.", config.model.name()))?;
    let system = LagrangianSystem::new(Arc::new(equations), params)?.with_input(config.input);
    Ok((model, system))
}

pub fn run(config: &RunConfig) -> Result<RunOutput> {
    let (model, system) = build_system(config)?;
    let initial_state = config.initial_state();
    info!(
        model = config.model.name(),
        input = config.input,
        "Running simulation"
    );

    let trajectory = simulate(&system, &initial_state, &config.settings)
        .with_context(|| format!("Simulation of {} failed.", config.model.name()))?;

    let frames = match config.model {
        ModelConfig::BallAndBeam {
            params,
            beam_length,
        } => Some(
            trajectory
                .points
                .iter()
                .map(|point| {
                    // States come from a 2-DOF system, so they hold [x, theta, xdot, thetadot].
                    let (x, theta) = (point.state[0], point.state[1]);
                    Frame {
                        t: point.t,
                        ball: ball_centre(x, theta, params.r),
                        beam: beam_endpoints(theta, beam_length),
                    }
                })
                .collect(),
        ),
        ModelConfig::Oscillator { .. } => None,
    };

    Ok(RunOutput {
        model: config.model.name().to_string(),
        state_names: model.state_names(),
        trajectory,
        frames,
    })
}

/// Newton search for an equilibrium starting from the configured initial state.
pub fn find_equilibrium(config: &RunConfig) -> Result<EquilibriumResult> {
    let (_, system) = build_system(config)?;
    solve_equilibrium(&system, &config.initial_state(), NewtonSettings::default())
        .context("Equilibrium solve failed.")
}
