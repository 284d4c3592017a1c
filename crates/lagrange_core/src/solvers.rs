use crate::error::{SimulationError, SimulationResult};
use crate::traits::{DynamicalSystem, Scalar, Steppable};

fn check_dimension<T: Scalar>(
    system: &impl DynamicalSystem<T>,
    state: &[T],
    buffers: usize,
) -> SimulationResult<()> {
    let dim = system.dimension();
    if state.len() != dim {
        return Err(SimulationError::dimension_mismatch("state", dim, state.len()));
    }
    if buffers != dim {
        return Err(SimulationError::dimension_mismatch("solver buffers", dim, buffers));
    }
    Ok(())
}

/// Forward Euler: `y_next = y + dt * f(t, y)`.
pub struct ForwardEuler<T: Scalar> {
    k1: Vec<T>,
}

impl<T: Scalar> ForwardEuler<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for ForwardEuler<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> SimulationResult<()> {
        check_dimension(system, state, self.k1.len())?;
        system.apply(*t, state, &mut self.k1)?;
        for i in 0..state.len() {
            state[i] = state[i] + dt * self.k1[i];
        }
        *t = *t + dt;
        Ok(())
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> SimulationResult<()> {
        check_dimension(system, state, self.k1.len())?;
        let half = T::lift(0.5);
        let sixth = T::lift(1.0 / 6.0);
        let two = T::lift(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

// Tsit5 tableau (Tsitouras 2011). Each row of A sums to its node c_i.
const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;

const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;

const A41: f64 = 2.897153057105493;
const A42: f64 = -6.359448489975075;
const A43: f64 = 4.3622954328695815;

const A51: f64 = 5.325864828439257;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.4955393428898365;
const A54: f64 = -0.09249506636175525;

const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.028269050394068383;

// b coefficients (5th order), equal to the last row of A.
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436081;
const B6: f64 = 2.324710524099774;

// b - b_hat, the embedded error estimator.
const E1: f64 = -0.00178001105222577714;
const E2: f64 = -0.0008164344596567469;
const E3: f64 = 0.007880878010261995;
const E4: f64 = -0.1447110071732629;
const E5: f64 = 0.5823571654525552;
const E6: f64 = -0.45808210592918697;
const E7: f64 = 0.015151515151515152;

/// Tsitouras 5/4 Solver
pub struct Tsit5<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    k5: Vec<T>,
    k6: Vec<T>,
    k7: Vec<T>,
    tmp: Vec<T>,
    error: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            k5: vec![z; dim],
            k6: vec![z; dim],
            k7: vec![z; dim],
            tmp: vec![z; dim],
            error: vec![z; dim],
        }
    }

    /// Computes a trial step from `(t0, state)` into `out` without committing it,
    /// and fills the local error estimate (see [`Tsit5::error_estimate`]).
    pub fn attempt(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t0: T,
        state: &[T],
        dt: T,
        out: &mut [T],
    ) -> SimulationResult<()> {
        check_dimension(system, state, self.k1.len())?;
        if out.len() != state.len() {
            return Err(SimulationError::dimension_mismatch("step output", state.len(), out.len()));
        }
        let c = |v: f64| T::lift(v);
        let n = state.len();

        // k1
        system.apply(t0, state, &mut self.k1)?;

        // k2
        for i in 0..n {
            self.tmp[i] = state[i] + dt * (c(A21) * self.k1[i]);
        }
        system.apply(t0 + c(C2) * dt, &self.tmp, &mut self.k2)?;

        // k3
        for i in 0..n {
            self.tmp[i] = state[i] + dt * (c(A31) * self.k1[i] + c(A32) * self.k2[i]);
        }
        system.apply(t0 + c(C3) * dt, &self.tmp, &mut self.k3)?;

        // k4
        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (c(A41) * self.k1[i] + c(A42) * self.k2[i] + c(A43) * self.k3[i]);
        }
        system.apply(t0 + c(C4) * dt, &self.tmp, &mut self.k4)?;

        // k5
        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (c(A51) * self.k1[i]
                    + c(A52) * self.k2[i]
                    + c(A53) * self.k3[i]
                    + c(A54) * self.k4[i]);
        }
        system.apply(t0 + c(C5) * dt, &self.tmp, &mut self.k5)?;

        // k6
        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (c(A61) * self.k1[i]
                    + c(A62) * self.k2[i]
                    + c(A63) * self.k3[i]
                    + c(A64) * self.k4[i]
                    + c(A65) * self.k5[i]);
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k6)?;

        // 5th order solution
        for i in 0..n {
            out[i] = state[i]
                + dt * (c(B1) * self.k1[i]
                    + c(B2) * self.k2[i]
                    + c(B3) * self.k3[i]
                    + c(B4) * self.k4[i]
                    + c(B5) * self.k5[i]
                    + c(B6) * self.k6[i]);
        }

        // k7 = f(t + dt, y_next) feeds the error estimate
        system.apply(t0 + dt, out, &mut self.k7)?;
        for i in 0..n {
            self.error[i] = dt
                * (c(E1) * self.k1[i]
                    + c(E2) * self.k2[i]
                    + c(E3) * self.k3[i]
                    + c(E4) * self.k4[i]
                    + c(E5) * self.k5[i]
                    + c(E6) * self.k6[i]
                    + c(E7) * self.k7[i]);
        }
        Ok(())
    }

    /// Difference between the 5th and embedded 4th order solutions of the last
    /// [`Tsit5::attempt`].
    pub fn error_estimate(&self) -> &[T] {
        &self.error
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> SimulationResult<()> {
        let mut next = vec![T::zero(); state.len()];
        self.attempt(system, *t, state, dt, &mut next)?;
        state.copy_from_slice(&next);
        *t = *t + dt;
        Ok(())
    }
}
