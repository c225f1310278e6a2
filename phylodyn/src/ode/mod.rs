//! Ordinary differential equations along tree branches.
//!
//! State-dependent diversification likelihoods integrate a system of the
//! form `[E_1..E_K, D_1..D_K]` backwards in time, from the younger end of a
//! branch to the older end. The systems implement [`OdeSystem`] and are
//! integrated by [`integrate`] with either a fixed-step classical
//! Runge-Kutta scheme or an adaptive Dormand-Prince 5(4) pair.

pub mod bisse;
pub mod clado;
pub mod coalescent_migration;
pub mod morphospeciation;

use phylodyn_core::{PhyloError, Result};
use tracing::trace;

pub use bisse::BiSse;
pub use clado::{CdCladoSeObserved, CladogeneticEvent};
pub use coalescent_migration::MultispeciesCoalescentMigrationOde;
pub use morphospeciation::MorphospeciationOde;

/// A first-order system `dx/dt = f(t, x)`.
pub trait OdeSystem {
    /// Length of the state vector.
    fn dimension(&self) -> usize;

    /// Write `f(t, x)` into `dxdt`.
    fn derivatives(&self, t: f64, x: &[f64], dxdt: &mut [f64]);
}

/// Integration scheme.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntegrationMethod {
    /// Classical fourth-order Runge-Kutta with a fixed step, shortened so a
    /// whole number of steps spans the interval.
    RungeKutta4 { step: f64 },
    /// Dormand-Prince 5(4) with adaptive step size.
    DormandPrince { abs_tol: f64, rel_tol: f64 },
}

/// Configuration for [`integrate`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntegratorConfig {
    /// Integration scheme.
    pub method: IntegrationMethod,
    /// Reset negative entries to zero after every accepted step.
    pub clamp_negative: bool,
    /// Maximum number of steps (accepted or rejected) per call.
    pub max_steps: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::RungeKutta4 { step: 0.01 },
            clamp_negative: false,
            max_steps: 1_000_000,
        }
    }
}

impl IntegratorConfig {
    /// Adaptive Dormand-Prince with the given tolerances.
    pub fn dormand_prince(abs_tol: f64, rel_tol: f64) -> Self {
        Self {
            method: IntegrationMethod::DormandPrince { abs_tol, rel_tol },
            ..Self::default()
        }
    }

    /// Builder-style toggle for clamping.
    pub fn with_clamping(mut self, clamp: bool) -> Self {
        self.clamp_negative = clamp;
        self
    }
}

/// Integrate `system` from `t0` to `t1` in place.
///
/// # Errors
///
/// Returns [`PhyloError::InvalidInput`] if the state has the wrong length or
/// `t1 < t0`, and [`PhyloError::Numerical`] if the state stops being finite
/// or the step budget runs out.
pub fn integrate<S: OdeSystem + ?Sized>(
    system: &S,
    state: &mut [f64],
    t0: f64,
    t1: f64,
    config: &IntegratorConfig,
) -> Result<()> {
    let dim = system.dimension();
    if state.len() != dim {
        return Err(PhyloError::InvalidInput(format!(
            "state has {} entries, system expects {}",
            state.len(),
            dim
        )));
    }
    if !(t1 >= t0) {
        return Err(PhyloError::InvalidInput(format!(
            "cannot integrate from {} back to {}",
            t0, t1
        )));
    }
    if t1 == t0 {
        return Ok(());
    }
    match config.method {
        IntegrationMethod::RungeKutta4 { step } => rk4(system, state, t0, t1, step, config),
        IntegrationMethod::DormandPrince { abs_tol, rel_tol } => {
            dormand_prince(system, state, t0, t1, abs_tol, rel_tol, config)
        }
    }
}

fn clamp(state: &mut [f64]) {
    for x in state.iter_mut() {
        if *x < 0.0 {
            *x = 0.0;
        }
    }
}

fn check_finite(state: &[f64], t: f64) -> Result<()> {
    if state.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(PhyloError::Numerical(format!("state became non-finite at t = {}", t)))
    }
}

fn rk4<S: OdeSystem + ?Sized>(
    system: &S,
    state: &mut [f64],
    t0: f64,
    t1: f64,
    step: f64,
    config: &IntegratorConfig,
) -> Result<()> {
    if !(step > 0.0) {
        return Err(PhyloError::InvalidInput(format!("step size {} is not positive", step)));
    }
    let n_steps = ((t1 - t0) / step).ceil().max(1.0) as usize;
    if n_steps > config.max_steps {
        return Err(PhyloError::Numerical(format!(
            "{} steps needed, budget is {}",
            n_steps, config.max_steps
        )));
    }
    let h = (t1 - t0) / n_steps as f64;
    let dim = state.len();
    let (mut k1, mut k2, mut k3, mut k4) =
        (vec![0.0; dim], vec![0.0; dim], vec![0.0; dim], vec![0.0; dim]);
    let mut tmp = vec![0.0; dim];

    for i in 0..n_steps {
        let t = t0 + i as f64 * h;
        system.derivatives(t, state, &mut k1);
        for j in 0..dim {
            tmp[j] = state[j] + 0.5 * h * k1[j];
        }
        system.derivatives(t + 0.5 * h, &tmp, &mut k2);
        for j in 0..dim {
            tmp[j] = state[j] + 0.5 * h * k2[j];
        }
        system.derivatives(t + 0.5 * h, &tmp, &mut k3);
        for j in 0..dim {
            tmp[j] = state[j] + h * k3[j];
        }
        system.derivatives(t + h, &tmp, &mut k4);
        for j in 0..dim {
            state[j] += h / 6.0 * (k1[j] + 2.0 * k2[j] + 2.0 * k3[j] + k4[j]);
        }
        if config.clamp_negative {
            clamp(state);
        }
        check_finite(state, t + h)?;
    }
    Ok(())
}

// Dormand-Prince 5(4) tableau.
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0],
    [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0],
    [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
];
// Fifth-order weights minus the embedded fourth-order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

fn dormand_prince<S: OdeSystem + ?Sized>(
    system: &S,
    state: &mut [f64],
    t0: f64,
    t1: f64,
    abs_tol: f64,
    rel_tol: f64,
    config: &IntegratorConfig,
) -> Result<()> {
    let dim = state.len();
    let mut k = vec![vec![0.0; dim]; 7];
    let mut tmp = vec![0.0; dim];
    let mut next = vec![0.0; dim];
    let mut t = t0;
    let mut h = ((t1 - t0) / 100.0).min(0.1);
    let mut steps = 0usize;
    let mut rejected = 0usize;

    system.derivatives(t, state, &mut k[0]);
    while t < t1 {
        if steps >= config.max_steps {
            return Err(PhyloError::Numerical(format!(
                "step budget of {} exhausted at t = {} (target {})",
                config.max_steps, t, t1
            )));
        }
        steps += 1;
        let last = h >= t1 - t;
        if last {
            h = t1 - t;
        }

        for s in 1..7 {
            for j in 0..dim {
                let mut acc = state[j];
                for (r, row) in k.iter().enumerate().take(s) {
                    acc += h * A[s][r] * row[j];
                }
                tmp[j] = acc;
            }
            system.derivatives(t + C[s] * h, &tmp, &mut k[s]);
            if s == 6 {
                next.copy_from_slice(&tmp);
            }
        }

        let mut err = 0.0;
        for j in 0..dim {
            let e: f64 = (0..7).map(|s| E[s] * k[s][j]).sum::<f64>() * h;
            let scale = abs_tol + rel_tol * state[j].abs().max(next[j].abs());
            err += (e / scale).powi(2);
        }
        let err = (err / dim.max(1) as f64).sqrt();

        if err <= 1.0 || h < 1e-14 {
            t = if last { t1 } else { t + h };
            state.copy_from_slice(&next);
            if config.clamp_negative {
                clamp(state);
            }
            check_finite(state, t)?;
            // First-same-as-last: the last stage is the next first stage.
            let fsal = k[6].clone();
            k[0] = fsal;
            if config.clamp_negative {
                system.derivatives(t, state, &mut k[0]);
            }
        } else {
            rejected += 1;
        }
        let factor = if err == 0.0 {
            5.0
        } else {
            (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
        };
        h *= factor;
    }
    trace!(steps, rejected, "dormand-prince integration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay(f64);

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
            dxdt[0] = -self.0 * x[0];
        }
    }

    /// x'' = -x written as a first-order system.
    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
            dxdt[0] = x[1];
            dxdt[1] = -x[0];
        }
    }

    #[test]
    fn rk4_exponential_decay() {
        let mut x = [1.0];
        integrate(&Decay(2.0), &mut x, 0.0, 1.5, &IntegratorConfig::default()).unwrap();
        assert!((x[0] - (-3.0f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn dormand_prince_oscillator() {
        let mut x = [1.0, 0.0];
        let config = IntegratorConfig::dormand_prince(1e-10, 1e-10);
        integrate(&Oscillator, &mut x, 0.0, 10.0, &config).unwrap();
        assert!((x[0] - 10f64.cos()).abs() < 1e-7);
        assert!((x[1] + 10f64.sin()).abs() < 1e-7);
    }

    #[test]
    fn zero_length_interval_is_a_no_op() {
        let mut x = [0.7];
        integrate(&Decay(1.0), &mut x, 2.0, 2.0, &IntegratorConfig::default()).unwrap();
        assert_eq!(x[0], 0.7);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut x = [1.0, 2.0];
        assert!(integrate(&Decay(1.0), &mut x, 0.0, 1.0, &IntegratorConfig::default()).is_err());
        let mut x = [1.0];
        assert!(integrate(&Decay(1.0), &mut x, 1.0, 0.0, &IntegratorConfig::default()).is_err());
    }

    #[test]
    fn step_budget_is_enforced() {
        let mut x = [1.0];
        let config = IntegratorConfig {
            max_steps: 10,
            ..IntegratorConfig::default()
        };
        assert!(matches!(
            integrate(&Decay(1.0), &mut x, 0.0, 1.0, &config),
            Err(PhyloError::Numerical(_))
        ));
    }

    #[test]
    fn clamping_keeps_states_non_negative() {
        struct Drain;
        impl OdeSystem for Drain {
            fn dimension(&self) -> usize {
                1
            }
            fn derivatives(&self, _t: f64, _x: &[f64], dxdt: &mut [f64]) {
                dxdt[0] = -1.0;
            }
        }
        let mut x = [0.5];
        let config = IntegratorConfig::default().with_clamping(true);
        integrate(&Drain, &mut x, 0.0, 1.0, &config).unwrap();
        assert_eq!(x[0], 0.0);
    }
}
