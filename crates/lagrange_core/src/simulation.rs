//! Time-stepping driver producing sampled trajectories.
//!
//! Output times are evenly spaced between `t_start` and `t_end` (both included).
//! Fixed-step methods shorten their last step before each output time so samples
//! land exactly on it; the adaptive method clips its steps the same way.

use crate::error::{SimulationError, SimulationResult};
use crate::propagator::LagrangianSystem;
use crate::solvers::{ForwardEuler, Tsit5, RK4};
use crate::traits::{DynamicalSystem, Steppable};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegratorMethod {
    /// Forward Euler with fixed step `dt`.
    Euler { dt: f64 },
    /// Classic fourth-order Runge-Kutta with fixed step `dt`.
    Rk4 { dt: f64 },
    /// Tsitouras 5(4) with fixed step `dt`.
    Tsit5 { dt: f64 },
    /// Tsitouras 5(4) with step-size control on the embedded error estimate.
    AdaptiveTsit5 {
        rtol: f64,
        atol: f64,
        initial_dt: f64,
        min_dt: f64,
        max_steps: usize,
    },
}

impl Default for IntegratorMethod {
    fn default() -> Self {
        Self::AdaptiveTsit5 {
            rtol: 1e-6,
            atol: 1e-9,
            initial_dt: 1e-3,
            min_dt: 1e-12,
            max_steps: 1_000_000,
        }
    }
}

impl IntegratorMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler { .. } => "euler",
            Self::Rk4 { .. } => "rk4",
            Self::Tsit5 { .. } => "tsit5",
            Self::AdaptiveTsit5 { .. } => "adaptive_tsit5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub t_start: f64,
    pub t_end: f64,
    /// Number of output samples, endpoints included.
    pub samples: usize,
    pub method: IntegratorMethod,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            t_start: 0.0,
            t_end: 10.0,
            samples: 300,
            method: IntegratorMethod::default(),
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> SimulationResult<()> {
        if !self.t_start.is_finite() || !self.t_end.is_finite() {
            return Err(SimulationError::invalid_settings("time span must be finite"));
        }
        if self.t_start == self.t_end {
            return Err(SimulationError::invalid_settings("time span is empty"));
        }
        if self.samples < 2 {
            return Err(SimulationError::invalid_settings(
                "at least two samples are required",
            ));
        }
        match self.method {
            IntegratorMethod::Euler { dt }
            | IntegratorMethod::Rk4 { dt }
            | IntegratorMethod::Tsit5 { dt } => {
                if !(dt.is_finite() && dt > 0.0) {
                    return Err(SimulationError::invalid_settings("dt must be positive"));
                }
            }
            IntegratorMethod::AdaptiveTsit5 {
                rtol,
                atol,
                initial_dt,
                min_dt,
                max_steps,
            } => {
                if !(rtol >= 0.0 && atol >= 0.0 && rtol + atol > 0.0) {
                    return Err(SimulationError::invalid_settings(
                        "tolerances must be non-negative and not both zero",
                    ));
                }
                if !(initial_dt.is_finite() && initial_dt > 0.0) {
                    return Err(SimulationError::invalid_settings(
                        "initial_dt must be positive",
                    ));
                }
                if !(min_dt >= 0.0 && min_dt <= initial_dt) {
                    return Err(SimulationError::invalid_settings(
                        "min_dt must lie in [0, initial_dt]",
                    ));
                }
                if max_steps == 0 {
                    return Err(SimulationError::invalid_settings(
                        "max_steps must be greater than zero",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evenly spaced output times, like `linspace(t_start, t_end, samples)`.
    /// Zero samples give no times and one sample gives `[t_end]`.
    pub fn sample_times(&self) -> Vec<f64> {
        let last = self.samples.saturating_sub(1).max(1) as f64;
        (0..self.samples)
            .map(|i| {
                if i + 1 == self.samples {
                    self.t_end
                } else {
                    self.t_start + (self.t_end - self.t_start) * (i as f64 / last)
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub t: f64,
    pub state: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// Sampled solution: `(t, state)` pairs in integration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.t).collect()
    }

    /// Time series of one state component.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.points
            .iter()
            .filter_map(|p| p.state.get(index).copied())
            .collect()
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.points.last().map(|p| p.state.as_slice())
    }

    /// CSV with a `t` column followed by one column per state component.
    pub fn to_csv(&self, state_names: &[String]) -> String {
        let mut out = String::from("t");
        for name in state_names {
            out.push(',');
            out.push_str(name);
        }
        out.push('\n');
        for point in &self.points {
            let _ = write!(out, "{}", point.t);
            for value in &point.state {
                let _ = write!(out, ",{value}");
            }
            out.push('\n');
        }
        out
    }
}

/// Integrates `system` from `initial_state` and samples it at the output times.
pub fn simulate<S>(
    system: &S,
    initial_state: &[f64],
    settings: &SimulationSettings,
) -> SimulationResult<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    settings.validate()?;
    let dim = system.dimension();
    if initial_state.len() != dim {
        return Err(SimulationError::dimension_mismatch(
            "initial state",
            dim,
            initial_state.len(),
        ));
    }
    check_finite(initial_state, settings.t_start)?;

    info!(
        method = settings.method.name(),
        t_start = settings.t_start,
        t_end = settings.t_end,
        samples = settings.samples,
        "Starting simulation"
    );

    let times = settings.sample_times();
    let trajectory = match settings.method {
        IntegratorMethod::Euler { dt } => {
            run_fixed(ForwardEuler::new(dim), system, initial_state, &times, dt)
        }
        IntegratorMethod::Rk4 { dt } => run_fixed(RK4::new(dim), system, initial_state, &times, dt),
        IntegratorMethod::Tsit5 { dt } => {
            run_fixed(Tsit5::new(dim), system, initial_state, &times, dt)
        }
        IntegratorMethod::AdaptiveTsit5 {
            rtol,
            atol,
            initial_dt,
            min_dt,
            max_steps,
        } => run_adaptive(
            system,
            initial_state,
            &times,
            AdaptiveControl {
                rtol,
                atol,
                initial_dt,
                min_dt,
                max_steps,
            },
        ),
    }?;

    info!(
        accepted = trajectory.stats.accepted_steps,
        rejected = trajectory.stats.rejected_steps,
        "Simulation finished"
    );
    Ok(trajectory)
}

fn check_finite(state: &[f64], t: f64) -> SimulationResult<()> {
    if state.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SimulationError::NonFinite(format!("state at t = {t}")))
    }
}

fn reached(t: f64, target: f64) -> bool {
    (target - t).abs() <= 1e-12 * target.abs().max(1.0)
}

fn run_fixed<St, S>(
    mut stepper: St,
    system: &S,
    initial_state: &[f64],
    times: &[f64],
    dt: f64,
) -> SimulationResult<Trajectory>
where
    St: Steppable<f64>,
    S: DynamicalSystem<f64> + ?Sized,
{
    let mut t = times[0];
    let mut state = initial_state.to_vec();
    let mut trajectory = Trajectory::default();
    trajectory.points.push(TrajectoryPoint {
        t,
        state: state.clone(),
    });

    for &target in &times[1..] {
        while !reached(t, target) {
            let remaining = target - t;
            let h = remaining.signum() * dt.min(remaining.abs());
            stepper.step(&system, &mut t, &mut state, h)?;
            check_finite(&state, t)?;
            trajectory.stats.accepted_steps += 1;
        }
        t = target;
        trajectory.points.push(TrajectoryPoint {
            t,
            state: state.clone(),
        });
    }
    Ok(trajectory)
}

#[derive(Debug, Clone, Copy)]
struct AdaptiveControl {
    rtol: f64,
    atol: f64,
    initial_dt: f64,
    min_dt: f64,
    max_steps: usize,
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Scaled RMS norm of the local error estimate.
fn error_norm(error: &[f64], old: &[f64], new: &[f64], rtol: f64, atol: f64) -> f64 {
    let sum: f64 = error
        .iter()
        .zip(old.iter().zip(new))
        .map(|(e, (y0, y1))| {
            let scale = atol + rtol * y0.abs().max(y1.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / error.len().max(1) as f64).sqrt()
}

fn run_adaptive<S>(
    system: &S,
    initial_state: &[f64],
    times: &[f64],
    control: AdaptiveControl,
) -> SimulationResult<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = initial_state.len();
    let mut solver = Tsit5::new(dim);
    let mut t = times[0];
    let mut state = initial_state.to_vec();
    let mut candidate = vec![0.0; dim];
    let mut h = control.initial_dt;
    let mut attempts = 0usize;

    let mut trajectory = Trajectory::default();
    trajectory.points.push(TrajectoryPoint {
        t,
        state: state.clone(),
    });

    for &target in &times[1..] {
        while !reached(t, target) {
            if attempts >= control.max_steps {
                return Err(SimulationError::MaxStepsExceeded(control.max_steps));
            }
            attempts += 1;

            let remaining = target - t;
            let clipped = h >= remaining.abs();
            let step = remaining.signum() * h.min(remaining.abs());

            solver.attempt(&system, t, &state, step, &mut candidate)?;
            let err = error_norm(
                solver.error_estimate(),
                &state,
                &candidate,
                control.rtol,
                control.atol,
            );

            let accepted = err <= 1.0;
            let factor = if err == 0.0 {
                MAX_FACTOR
            } else if err.is_finite() {
                (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            } else {
                MIN_FACTOR
            };
            let proposed = step.abs() * factor;

            if accepted {
                t = if clipped { target } else { t + step };
                state.copy_from_slice(&candidate);
                trajectory.stats.accepted_steps += 1;
                // A step shortened to hit an output time says nothing about the
                // admissible step size, so it may not shrink `h`.
                h = if clipped { h.max(proposed) } else { proposed };
            } else {
                trajectory.stats.rejected_steps += 1;
                debug!(t, dt = step, err, "Rejected adaptive step");
                h = proposed;
            }

            if h < control.min_dt {
                return Err(SimulationError::StepSizeUnderflow { t, dt: h });
            }
        }
        trajectory.points.push(TrajectoryPoint {
            t: target,
            state: state.clone(),
        });
    }
    Ok(trajectory)
}

/// Largest relative deviation of `T + V` from its initial value along a
/// trajectory, relative to `max(|E0|, 1)`.
pub fn energy_drift<S>(system: &LagrangianSystem<S>, trajectory: &Trajectory) -> SimulationResult<f64> {
    let Some(first) = trajectory.points.first() else {
        return Ok(0.0);
    };
    let initial = system.total_energy(&first.state)?;
    let scale = initial.abs().max(1.0);
    let mut drift: f64 = 0.0;
    for point in &trajectory.points {
        let energy = system.total_energy(&point.state)?;
        drift = drift.max((energy - initial).abs() / scale);
    }
    Ok(drift)
}
