//! Closed-form quantities of the constant-rate birth-death-sampling process.

use phylodyn_core::{PhyloError, Result};
use rand::{Rng, RngCore};

use crate::graph::Graph;
use crate::model::{ParameterSet, Role};

/// Speciation λ, extinction μ, serial sampling ψ and extant sampling ρ with
/// the derived constants `c1` and `c2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantRateTerms {
    pub lambda: f64,
    pub mu: f64,
    pub psi: f64,
    pub rho: f64,
    c1: f64,
    c2: f64,
}

impl ConstantRateTerms {
    pub fn new(lambda: f64, mu: f64, psi: f64, rho: f64) -> Self {
        let c1 = ((lambda - mu - psi).powi(2) + 4.0 * lambda * psi).sqrt();
        let c2 = -(lambda - mu - 2.0 * lambda * rho - psi) / c1;
        Self {
            lambda,
            mu,
            psi,
            rho,
            c1,
            c2,
        }
    }

    /// Read the rates from the graph. ψ is zero when no fossilization
    /// parameter is registered.
    pub fn from_parameters(params: &ParameterSet, graph: &Graph) -> Result<Self> {
        let lambda = params.real(graph, Role::Speciation)?;
        let mu = params.real(graph, Role::Extinction)?;
        let psi = match params.optional(Role::Fossilization) {
            Some(id) => graph.real(id)?,
            None => 0.0,
        };
        let rho = params.real(graph, Role::SamplingFraction)?;
        if !(0.0..=1.0).contains(&rho) {
            return Err(PhyloError::InvalidInput(format!(
                "sampling fraction {} is not a probability",
                rho
            )));
        }
        if lambda <= 0.0 || mu < 0.0 || psi < 0.0 {
            return Err(PhyloError::InvalidInput(format!(
                "rates must be non-negative with positive speciation (λ={}, μ={}, ψ={})",
                lambda, mu, psi
            )));
        }
        Ok(Self::new(lambda, mu, psi, rho))
    }

    pub fn c1(&self) -> f64 {
        self.c1
    }

    pub fn c2(&self) -> f64 {
        self.c2
    }

    /// Probability that a lineage alive at age `t` leaves no sampled
    /// descendant.
    pub fn p0(&self, t: f64) -> f64 {
        let e = (-self.c1 * t).exp();
        let (a, b) = (1.0 - self.c2, 1.0 + self.c2);
        (self.lambda + self.mu + self.psi + self.c1 * (e * a - b) / (e * a + b)) / (2.0 * self.lambda)
    }

    /// `ln Q(t)` with `Q(t) = (e^{-c1 t}(1 - c2) + (1 + c2))^2 / e^{-c1 t}`,
    /// evaluated so that large `c1 t` does not overflow. The branch density
    /// of a lineage spanning `(0, t)` is `4 / Q(t)`.
    pub fn ln_q(&self, t: f64) -> f64 {
        let x = -self.c1 * t;
        if x < 0.0 {
            self.c1 * t + 2.0 * (x.exp() * (1.0 - self.c2) + (1.0 + self.c2)).ln()
        } else {
            -self.c1 * t + 2.0 * ((1.0 - self.c2) + (-x).exp() * (1.0 + self.c2)).ln()
        }
    }
}

/// Log probability that a taxon missing from a clade attached below the
/// clade's MRCA at `clade_age` rather than anywhere below `start_age`,
/// under complete sampling.
///
/// A surviving lineage of age `t` with more than one descendant has split
/// below `t`; the ratio of those probabilities at the two ages is the chance
/// the extra split falls inside the clade.
pub fn ln_missing_lineage_prob(lambda: f64, mu: f64, clade_age: f64, start_age: f64) -> f64 {
    let terms = ConstantRateTerms::new(lambda, mu, 0.0, 1.0);
    let not_alone = |t: f64| {
        let survival = 1.0 - terms.p0(t);
        1.0 - (4f64.ln() - terms.ln_q(t)).exp() / survival
    };
    not_alone(clade_age).ln() - not_alone(start_age).ln()
}

/// Draw a divergence age in `(0, start_age)` by inverting the CDF of node
/// ages under a birth-death process with sampling fraction `rho`.
///
/// Fossil sampling is ignored, so draws do not follow the full density; the
/// result only seeds starting trees.
pub fn simulate_divergence_time(
    lambda: f64,
    mu: f64,
    rho: f64,
    start_age: f64,
    rng: &mut dyn RngCore,
) -> f64 {
    let u: f64 = rng.gen();
    divergence_time_quantile(lambda, mu, rho, start_age, u)
}

/// Quantile `u` of the divergence-age distribution used by
/// [`simulate_divergence_time`].
pub fn divergence_time_quantile(b: f64, d: f64, rho: f64, age: f64, u: f64) -> f64 {
    let r = b - d;
    if rho <= 0.0 {
        if r.abs() < 1e-12 {
            return u * age;
        }
        let e = (age * (d - b)).exp();
        return (1.0 - u * (e - 1.0) / e).ln() / r;
    }
    if r.abs() < 1e-12 {
        let y = u * rho * b * age / (1.0 + rho * b * age);
        return y / (rho * b * (1.0 - y));
    }
    let x = if r > 0.0 {
        let e = (-r * age).exp();
        r * e / (rho * b + (b * (1.0 - rho) - d) * e)
    } else {
        r / (rho * b * (r * age).exp() + (b * (1.0 - rho) - d))
    };
    ((r / (1.0 - u * (1.0 - x)) - (b * (1.0 - rho) - d)) / (rho * b)).ln() / r
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ln_q_is_finite(
            lambda in 0.01f64..10.0,
            mu in 0.0f64..10.0,
            psi in 0.0f64..5.0,
            rho in 0.05f64..=1.0,
            t in 0.0f64..1e6,
        ) {
            let terms = ConstantRateTerms::new(lambda, mu, psi, rho);
            let lq = terms.ln_q(t);
            prop_assert!(lq.is_finite());
            if terms.c1() * t < 500.0 && terms.c2().abs() < 10.0 {
                let c2 = terms.c2();
                let direct = (2.0 * (1.0 - c2 * c2)
                    + (-terms.c1() * t).exp() * (1.0 - c2).powi(2)
                    + (terms.c1() * t).exp() * (1.0 + c2).powi(2))
                .ln();
                prop_assert!((lq - direct).abs() < 1e-8 * direct.abs().max(1.0), "{} vs {}", lq, direct);
            }
        }

        #[test]
        fn quantile_is_monotone(u1 in 0.0f64..1.0, u2 in 0.0f64..1.0) {
            let (lo, hi) = if u1 < u2 { (u1, u2) } else { (u2, u1) };
            let a = divergence_time_quantile(1.2, 0.5, 0.7, 4.0, lo);
            let b = divergence_time_quantile(1.2, 0.5, 0.7, 4.0, hi);
            prop_assert!(a <= b + 1e-12);
        }
    }
}
