//! Binary-state (and multi-category) speciation-extinction ODE.
//!
//! `K` rate categories with speciation λ_i and extinction μ_i. Lineages
//! switch category at total rate η, uniformly among the other categories.
//! State layout is `[E_1..E_K, D_1..D_K]`:
//!
//! ```text
//! dE_i/dt = μ_i - (λ_i + μ_i + η) E_i + λ_i E_i^2 + η/(K-1) Σ_{j≠i} E_j
//! dD_i/dt = -(λ_i + μ_i + η) D_i + 2 λ_i D_i E_i + η/(K-1) Σ_{j≠i} D_j
//! ```

use phylodyn_core::{PhyloError, Result};

use super::OdeSystem;

#[derive(Debug, Clone, PartialEq)]
pub struct BiSse {
    speciation: Vec<f64>,
    extinction: Vec<f64>,
    shift_rate: f64,
}

impl BiSse {
    /// # Errors
    ///
    /// Returns an error if the rate vectors are empty or differ in length,
    /// or if any rate is negative.
    pub fn new(speciation: Vec<f64>, extinction: Vec<f64>, shift_rate: f64) -> Result<Self> {
        if speciation.is_empty() || speciation.len() != extinction.len() {
            return Err(PhyloError::InvalidInput(format!(
                "need matching non-empty rate vectors, got {} speciation and {} extinction rates",
                speciation.len(),
                extinction.len()
            )));
        }
        if speciation
            .iter()
            .chain(extinction.iter())
            .chain(std::iter::once(&shift_rate))
            .any(|&r| !(r >= 0.0))
        {
            return Err(PhyloError::InvalidInput("rates must be non-negative".into()));
        }
        Ok(Self {
            speciation,
            extinction,
            shift_rate,
        })
    }

    /// Number of rate categories.
    pub fn num_categories(&self) -> usize {
        self.speciation.len()
    }

    pub fn speciation(&self) -> &[f64] {
        &self.speciation
    }
}

impl OdeSystem for BiSse {
    fn dimension(&self) -> usize {
        2 * self.num_categories()
    }

    fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
        let k = self.num_categories();
        let eta = if k > 1 { self.shift_rate } else { 0.0 };
        let share = if k > 1 { eta / (k - 1) as f64 } else { 0.0 };
        let (e, d) = x.split_at(k);
        let e_total: f64 = e.iter().sum();
        let d_total: f64 = d.iter().sum();
        for i in 0..k {
            let (lambda, mu) = (self.speciation[i], self.extinction[i]);
            let out = lambda + mu + eta;
            dxdt[i] = mu - out * e[i] + lambda * e[i] * e[i] + share * (e_total - e[i]);
            dxdt[k + i] = -out * d[i] + 2.0 * lambda * d[i] * e[i] + share * (d_total - d[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::birth_death::constant::ConstantRateTerms;
    use crate::ode::{integrate, IntegratorConfig};

    #[test]
    fn single_category_matches_closed_form() {
        let (lambda, mu, rho) = (1.4, 0.6, 0.7);
        let system = BiSse::new(vec![lambda], vec![mu], 0.0).unwrap();
        let terms = ConstantRateTerms::new(lambda, mu, 0.0, rho);
        for &t in &[0.3, 1.0, 2.5] {
            let mut x = [1.0 - rho, rho];
            integrate(&system, &mut x, 0.0, t, &IntegratorConfig::default()).unwrap();
            assert!((x[0] - terms.p0(t)).abs() < 1e-8, "E at {}", t);
            // D(t)/D(0) = 4 / Q(t).
            let expected_d = rho * (4f64.ln() - terms.ln_q(t)).exp();
            assert!((x[1] - expected_d).abs() < 1e-8, "D at {}", t);
        }
    }

    #[test]
    fn equal_categories_behave_like_one() {
        let single = BiSse::new(vec![1.0], vec![0.4], 0.0).unwrap();
        let pair = BiSse::new(vec![1.0, 1.0], vec![0.4, 0.4], 0.8).unwrap();
        let mut x1 = [0.2, 0.8];
        let mut x2 = [0.2, 0.2, 0.8, 0.8];
        let config = IntegratorConfig::dormand_prince(1e-10, 1e-10);
        integrate(&single, &mut x1, 0.0, 2.0, &config).unwrap();
        integrate(&pair, &mut x2, 0.0, 2.0, &config).unwrap();
        assert!((x1[0] - x2[0]).abs() < 1e-8);
        assert!((x1[0] - x2[1]).abs() < 1e-8);
        assert!((x1[1] - x2[2]).abs() < 1e-8);
    }

    #[test]
    fn shifts_mix_categories() {
        let system = BiSse::new(vec![2.0, 0.5], vec![0.1, 0.1], 1.0).unwrap();
        let mut x = [0.0, 0.0, 1.0, 0.0];
        integrate(&system, &mut x, 0.0, 0.5, &IntegratorConfig::default()).unwrap();
        assert!(x[3] > 0.0);
        assert!(x[0] > 0.0 && x[0] < 1.0);
    }

    #[test]
    fn rejects_mismatched_rates() {
        assert!(BiSse::new(vec![1.0, 2.0], vec![0.1], 0.0).is_err());
        assert!(BiSse::new(vec![], vec![], 0.0).is_err());
        assert!(BiSse::new(vec![1.0], vec![-0.1], 0.0).is_err());
    }
}
