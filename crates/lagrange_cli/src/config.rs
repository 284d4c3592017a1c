//! Run configuration loaded from JSON.

use anyhow::{bail, Context, Result};
use lagrange_core::models::{BallAndBeamParameters, OscillatorParameters};
use lagrange_core::SimulationSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Which predefined model to run, with its physical constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    BallAndBeam {
        #[serde(default)]
        params: BallAndBeamParameters,
        /// Drawn beam length, used for the exported frames.
        #[serde(default = "default_beam_length")]
        beam_length: f64,
    },
    Oscillator {
        #[serde(default)]
        params: OscillatorParameters,
    },
}

fn default_beam_length() -> f64 {
    3.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::BallAndBeam {
            params: BallAndBeamParameters::default(),
            beam_length: default_beam_length(),
        }
    }
}

impl ModelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BallAndBeam { .. } => "ball_and_beam",
            Self::Oscillator { .. } => "oscillator",
        }
    }

    /// Initial state used when the configuration does not give one.
    pub fn default_initial_state(&self) -> Vec<f64> {
        match self {
            Self::BallAndBeam { .. } => vec![0.1, 5f64.to_radians(), 0.0, 0.0],
            Self::Oscillator { .. } => vec![1.0, 0.0],
        }
    }
}

/// Everything needed for one run. Missing fields fall back to the ball and beam
/// released at `x = 0.1`, `theta = 5 deg` with no torque, sampled 300 times over 10 s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub initial_state: Option<Vec<f64>>,
    /// External input held constant over the run.
    pub input: f64,
    pub settings: SimulationSettings,
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: RunConfig =
            serde_json::from_str(text).context("Failed to parse run configuration.")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn initial_state(&self) -> Vec<f64> {
        self.initial_state
            .clone()
            .unwrap_or_else(|| self.model.default_initial_state())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.input.is_finite() {
            bail!("input must be finite.");
        }
        if let ModelConfig::BallAndBeam { beam_length, .. } = self.model {
            if !(beam_length.is_finite() && beam_length > 0.0) {
                bail!("beam_length must be positive.");
            }
        }
        self.settings
            .validate()
            .context("Invalid simulation settings.")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagrange_core::IntegratorMethod;

    #[test]
    fn empty_config_is_the_ball_and_beam_scenario() {
        let config = RunConfig::from_json("{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.model.name(), "ball_and_beam");
        assert_eq!(config.settings.samples, 300);
        assert_eq!(config.settings.t_end, 10.0);
        let state = config.initial_state();
        assert_eq!(state.len(), 4);
        assert_eq!(state[0], 0.1);
    }

    #[test]
    fn oscillator_config_with_fixed_step() {
        let json = r#"{
            "model": { "kind": "oscillator", "params": { "d": 2.0 } },
            "initial_state": [0.5, 0.0],
            "input": 1.0,
            "settings": { "t_end": 30.0, "samples": 3001, "method": { "kind": "euler", "dt": 0.01 } }
        }"#;
        let config = RunConfig::from_json(json).unwrap();
        match config.model {
            ModelConfig::Oscillator { params } => {
                assert_eq!(params.d, 2.0);
                assert_eq!(params.m, 1.0);
            }
            other => panic!("unexpected model {other:?}"),
        }
        assert_eq!(config.initial_state(), vec![0.5, 0.0]);
        assert_eq!(config.settings.method, IntegratorMethod::Euler { dt: 0.01 });
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let err = RunConfig::from_json(r#"{ "settings": { "samples": 1 } }"#).unwrap_err();
        assert!(format!("{err:#}").contains("at least two samples"));

        assert!(RunConfig::from_json(r#"{ "model": { "kind": "pendulum" } }"#).is_err());
        assert!(RunConfig::from_json(
            r#"{ "model": { "kind": "ball_and_beam", "beam_length": -1.0 } }"#
        )
        .is_err());
    }
}
