//! End-to-end checks on the ball and beam: derivation, propagation and simulation.

use approx::assert_relative_eq;
use lagrange_core::equilibrium::{linearize, solve_equilibrium, EquilibriumKind, NewtonSettings};
use lagrange_core::models::{ball_and_beam, BallAndBeamParameters};
use lagrange_core::simulation::energy_drift;
use lagrange_core::traits::DynamicalSystem;
use lagrange_core::{
    derive_and_compile, simulate, DerivationOptions, IntegratorMethod, LagrangianSystem,
    SimulationError, SimulationSettings,
};
use std::sync::Arc;

fn system(params: BallAndBeamParameters) -> LagrangianSystem {
    let model = ball_and_beam().unwrap();
    let equations = derive_and_compile(&model, DerivationOptions::default()).unwrap();
    LagrangianSystem::new(Arc::new(equations), params.to_vec()).unwrap()
}

fn scenario_state() -> [f64; 4] {
    [0.1, 5f64.to_radians(), 0.0, 0.0]
}

#[test]
fn level_beam_with_centred_ball_is_at_rest() {
    let system = system(BallAndBeamParameters::default());
    let acc = system.accelerations(&[0.0, 0.0, 0.0, 0.0]).unwrap();
    assert_eq!(acc, vec![0.0, 0.0]);
}

#[test]
fn derivative_is_velocity_then_acceleration() {
    let system = system(BallAndBeamParameters::default());
    assert_eq!(DynamicalSystem::<f64>::dimension(&system), 4);

    let state = [0.2, -0.1, 0.5, 1.5];
    let mut out = [0.0; 4];
    system.apply(0.0, &state, &mut out).unwrap();
    assert_eq!(&out[..2], &state[2..]);
    assert_eq!(out[2..].to_vec(), system.accelerations(&state).unwrap());
}

#[test]
fn unforced_motion_conserves_energy() {
    let system = system(BallAndBeamParameters::default());
    let settings = SimulationSettings {
        t_start: 0.0,
        t_end: 10.0,
        samples: 101,
        method: IntegratorMethod::Rk4 { dt: 1e-3 },
    };
    let trajectory = simulate(&system, &scenario_state(), &settings).unwrap();
    let drift = energy_drift(&system, &trajectory).unwrap();
    assert!(drift < 1e-3, "relative energy drift {drift}");
}

#[test]
fn reference_scenario_stays_finite_and_theta_oscillates() {
    let system = system(BallAndBeamParameters::default());
    let settings = SimulationSettings {
        t_start: 0.0,
        t_end: 10.0,
        samples: 300,
        ..Default::default()
    };
    let trajectory = simulate(&system, &scenario_state(), &settings).unwrap();
    assert_eq!(trajectory.len(), 300);
    assert_eq!(trajectory.times()[299], 10.0);

    for point in &trajectory.points {
        assert!(point.state.iter().all(|v| v.is_finite()), "t = {}", point.t);
        assert!(point.state[0].abs() < 1e3);
        assert!(point.state[1].abs() < std::f64::consts::PI);
    }

    let theta = trajectory.component(1);
    let rising = theta.windows(2).any(|w| w[1] > w[0]);
    let falling = theta.windows(2).any(|w| w[1] < w[0]);
    assert!(rising && falling, "theta should not be monotonic");
}

#[test]
fn fixed_and_adaptive_integration_agree_early_on() {
    let system = system(BallAndBeamParameters::default());
    let short = SimulationSettings {
        t_start: 0.0,
        t_end: 1.0,
        samples: 11,
        method: IntegratorMethod::Rk4 { dt: 1e-3 },
    };
    let fixed = simulate(&system, &scenario_state(), &short).unwrap();
    let adaptive = simulate(
        &system,
        &scenario_state(),
        &SimulationSettings {
            method: IntegratorMethod::AdaptiveTsit5 {
                rtol: 1e-10,
                atol: 1e-12,
                initial_dt: 1e-3,
                min_dt: 1e-14,
                max_steps: 1_000_000,
            },
            ..short
        },
    )
    .unwrap();
    let (a, b) = (fixed.final_state().unwrap(), adaptive.final_state().unwrap());
    for i in 0..4 {
        assert_relative_eq!(a[i], b[i], epsilon = 1e-7);
    }
}

#[test]
fn massless_ball_makes_the_mass_matrix_singular() {
    let system = system(BallAndBeamParameters {
        m: 0.0,
        ..Default::default()
    });
    let err = system.accelerations(&scenario_state()).unwrap_err();
    assert!(matches!(err, SimulationError::NumericalSingularity(_)), "{err:?}");

    let settings = SimulationSettings {
        method: IntegratorMethod::Rk4 { dt: 0.01 },
        ..Default::default()
    };
    assert!(matches!(
        simulate(&system, &scenario_state(), &settings),
        Err(SimulationError::NumericalSingularity(_))
    ));
}

#[test]
fn upright_rest_state_is_a_saddle() {
    let system = system(BallAndBeamParameters::default());
    let linearization = linearize(&system, &[0.0; 4]).unwrap();
    assert_eq!(linearization.kind, EquilibriumKind::Saddle);

    let result = solve_equilibrium(&system, &[0.01, 0.01, 0.0, 0.0], NewtonSettings::default()).unwrap();
    for value in &result.state {
        assert!(value.abs() < 1e-8, "{:?}", result.state);
    }
    assert_eq!(result.linearization.kind, EquilibriumKind::Saddle);
}

#[test]
fn applied_torque_tilts_the_beam() {
    let system = system(BallAndBeamParameters::default()).with_input(5.0);
    let acc = system.accelerations(&[0.0, 0.0, 0.0, 0.0]).unwrap();
    assert!(acc[1] > 0.0);
}
