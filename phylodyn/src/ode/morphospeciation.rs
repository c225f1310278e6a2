//! Morphospeciation ODE over `K` morphological character states.
//!
//! A lineage in state `j` speciates asymmetrically at rate λ (one daughter
//! keeps `j`, the other takes a uniformly chosen different state), changes
//! state anagenetically at rate λ_a plus the character clock `rate`, goes
//! extinct at μ and is sampled as a fossil at ψ. With `X̄_{-j}` the mean over
//! the other states:
//!
//! ```text
//! dE_j/dt = μ - (λ + μ + ψ) E_j + λ E_j Ē_{-j} + (λ_a + rate)(Ē_{-j} - E_j)
//! dD_j/dt = -(λ + μ + ψ) D_j + λ (D_j Ē_{-j} + E_j D̄_{-j}) + (λ_a + rate)(D̄_{-j} - D_j)
//! ```
//!
//! With a single state the "other" mean is the state itself.
//!
//! No tree distribution in this crate drives this system; it is integrated
//! directly, starting from [`MorphospeciationOde::tip_state`]:
//!
//! ```
//! use phylodyn::ode::{integrate, IntegratorConfig, MorphospeciationOde};
//!
//! let ode = MorphospeciationOde::new(3, 1.0, 0.2, 0.4, 0.1, 1.0, 0.5).unwrap();
//! let mut x = ode.tip_state(Some(1));
//! integrate(&ode, &mut x, 0.0, 1.0, &IntegratorConfig::default()).unwrap();
//! assert!(x[4] > x[3]);
//! ```

use phylodyn_core::{PhyloError, Result};

use super::OdeSystem;

#[derive(Debug, Clone, PartialEq)]
pub struct MorphospeciationOde {
    num_states: usize,
    asymmetric_speciation: f64,
    anagenetic_speciation: f64,
    extinction: f64,
    fossilization: f64,
    sampling_fraction: f64,
    rate: f64,
}

impl MorphospeciationOde {
    /// # Errors
    ///
    /// Returns an error for zero states, negative rates or a sampling
    /// fraction outside `[0, 1]`.
    pub fn new(
        num_states: usize,
        asymmetric_speciation: f64,
        anagenetic_speciation: f64,
        extinction: f64,
        fossilization: f64,
        sampling_fraction: f64,
        rate: f64,
    ) -> Result<Self> {
        if num_states == 0 {
            return Err(PhyloError::InvalidInput("need at least one character state".into()));
        }
        let rates = [
            asymmetric_speciation,
            anagenetic_speciation,
            extinction,
            fossilization,
            rate,
        ];
        if rates.iter().any(|&r| !(r >= 0.0)) {
            return Err(PhyloError::InvalidInput("rates must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&sampling_fraction) {
            return Err(PhyloError::InvalidInput(format!(
                "sampling fraction {} outside [0, 1]",
                sampling_fraction
            )));
        }
        Ok(Self {
            num_states,
            asymmetric_speciation,
            anagenetic_speciation,
            extinction,
            fossilization,
            sampling_fraction,
            rate,
        })
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Initial `[E, D]` for an extant tip; `None` marks missing data.
    pub fn tip_state(&self, observed: Option<usize>) -> Vec<f64> {
        let k = self.num_states;
        let rho = self.sampling_fraction;
        let mut state = vec![1.0 - rho; 2 * k];
        for (j, d) in state[k..].iter_mut().enumerate() {
            *d = match observed {
                Some(s) if s != j => 0.0,
                _ => rho,
            };
        }
        state
    }

    fn mean_of_others(&self, values: &[f64], total: f64, j: usize) -> f64 {
        if self.num_states == 1 {
            values[j]
        } else {
            (total - values[j]) / (self.num_states - 1) as f64
        }
    }
}

impl OdeSystem for MorphospeciationOde {
    fn dimension(&self) -> usize {
        2 * self.num_states
    }

    fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
        let k = self.num_states;
        let lambda = self.asymmetric_speciation;
        let change = if k > 1 {
            self.anagenetic_speciation + self.rate
        } else {
            0.0
        };
        let out = lambda + self.extinction + self.fossilization;
        let (e, d) = x.split_at(k);
        let e_total: f64 = e.iter().sum();
        let d_total: f64 = d.iter().sum();
        for j in 0..k {
            let e_other = self.mean_of_others(e, e_total, j);
            let d_other = self.mean_of_others(d, d_total, j);
            dxdt[j] = self.extinction - out * e[j] + lambda * e[j] * e_other + change * (e_other - e[j]);
            dxdt[k + j] = -out * d[j]
                + lambda * (d[j] * e_other + e[j] * d_other)
                + change * (d_other - d[j]);
        }
    }
}
