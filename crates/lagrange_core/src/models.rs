//! Ready-made models: the ball and beam, and a damped mass-spring oscillator.

use crate::equation_engine::{parse, Expr};
use crate::error::ModelResult;
use crate::model::ModelDefinition;
use crate::symbolic;
use serde::{Deserialize, Serialize};

/// Physical constants of the ball and beam, bound in the order `J, M, R, g`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallAndBeamParameters {
    /// Beam moment of inertia about the pivot.
    #[serde(rename = "J")]
    pub j: f64,
    /// Ball mass.
    #[serde(rename = "M")]
    pub m: f64,
    /// Ball radius.
    #[serde(rename = "R")]
    pub r: f64,
    pub g: f64,
}

impl Default for BallAndBeamParameters {
    fn default() -> Self {
        Self {
            j: 1.0,
            m: 10.0,
            r: 0.25,
            g: 9.82,
        }
    }
}

impl BallAndBeamParameters {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.j, self.m, self.r, self.g]
    }
}

/// Ball rolling without slipping on a beam that pivots at its centre.
///
/// Coordinates are the ball's position `x` along the beam and the beam angle
/// `theta`; the input `T_o` is a torque on the beam. The ball centre sits at
/// `p = [x cos(theta) - R sin(theta), x sin(theta) + R cos(theta)]`.
pub fn ball_and_beam() -> ModelResult<ModelDefinition> {
    let builder = ModelDefinition::builder()
        .coordinate("x", "xdot")
        .coordinate("theta", "thetadot")
        .parameters(["J", "M", "R", "g"])
        .input("T_o");

    let px = parse("x * cos(theta) - R * sin(theta)")?;
    let py = parse("x * sin(theta) + R * cos(theta)")?;
    let vx = symbolic::time_derivative(&px, builder.declared_coordinates());
    let vy = symbolic::time_derivative(&py, builder.declared_coordinates());

    let half = || Expr::num(0.5);
    let square = |e: Expr| e.pow(Expr::num(2.0));
    let (j, m, r, g) = (Expr::var("J"), Expr::var("M"), Expr::var("R"), Expr::var("g"));
    let (xdot, thetadot) = (Expr::var("xdot"), Expr::var("thetadot"));

    let beam = half() * j * square(thetadot.clone());
    let translation = half() * m.clone() * (square(vx) + square(vy));
    let ball_inertia = Expr::num(0.4) * m.clone() * square(r.clone());
    let spin = thetadot + xdot / r;
    let rotation = half() * ball_inertia * square(spin);

    builder
        .kinetic_energy(beam + translation + rotation)
        .potential_energy(m * g * py)
        .forces(["0", "T_o"])
        .build()
}

/// World position of the ball centre at beam position `x` and beam angle `theta`.
pub fn ball_centre(x: f64, theta: f64, radius: f64) -> [f64; 2] {
    let (sin, cos) = theta.sin_cos();
    [x * cos - radius * sin, x * sin + radius * cos]
}

/// End points of a beam of total `length` centred on the pivot.
pub fn beam_endpoints(theta: f64, length: f64) -> [[f64; 2]; 2] {
    let (sin, cos) = theta.sin_cos();
    let half = 0.5 * length;
    [[-half * cos, -half * sin], [half * cos, half * sin]]
}

/// Mass, stiffness and damping, bound in the order `m, k, d`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorParameters {
    pub m: f64,
    pub k: f64,
    pub d: f64,
}

impl Default for OscillatorParameters {
    fn default() -> Self {
        Self {
            m: 1.0,
            k: 1.0,
            d: 0.5,
        }
    }
}

impl OscillatorParameters {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.m, self.k, self.d]
    }
}

/// `m x'' + d x' + k x = F`, with damping entering as a generalized force.
pub fn damped_oscillator() -> ModelResult<ModelDefinition> {
    ModelDefinition::builder()
        .coordinate("x", "xdot")
        .parameters(["m", "k", "d"])
        .input("F")
        .kinetic_energy("0.5 * m * xdot^2")
        .potential_energy("0.5 * k * x^2")
        .force("F - d * xdot")
        .build()
}
