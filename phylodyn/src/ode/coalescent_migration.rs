//! Location and survival of a single gene lineage under structured
//! coalescence with migration.
//!
//! `P_i` is the probability the lineage sits in population `i` and `L_i` the
//! probability it sits there without having coalesced with any of the `c_i`
//! background lineages of that population. Migration `m_ij` moves the
//! lineage from `i` to `j` (backwards in time):
//!
//! ```text
//! dP_i/dt = Σ_{j≠i} (m_ji P_j - m_ij P_i)
//! dL_i/dt = Σ_{j≠i} (m_ji L_j - m_ij L_i) - (c_i / Ne_i) L_i
//! ```
//!
//! The system stands alone: integrate it from
//! [`MultispeciesCoalescentMigrationOde::initial_state`] over the interval
//! of interest and read off
//! [`no_coalescence_probability`](MultispeciesCoalescentMigrationOde::no_coalescence_probability).

use phylodyn_core::{PhyloError, Result};

use super::OdeSystem;

#[derive(Debug, Clone, PartialEq)]
pub struct MultispeciesCoalescentMigrationOde {
    migration: Vec<Vec<f64>>,
    population_sizes: Vec<f64>,
    background_lineages: Vec<f64>,
    total_emigration: Vec<f64>,
}

impl MultispeciesCoalescentMigrationOde {
    /// # Errors
    ///
    /// Returns an error on dimension mismatches, negative migration rates or
    /// background counts, and non-positive population sizes.
    pub fn new(
        migration: Vec<Vec<f64>>,
        population_sizes: Vec<f64>,
        background_lineages: Vec<f64>,
    ) -> Result<Self> {
        let k = population_sizes.len();
        if k == 0
            || background_lineages.len() != k
            || migration.len() != k
            || migration.iter().any(|row| row.len() != k)
        {
            return Err(PhyloError::InvalidInput(format!(
                "need a {0} x {0} migration matrix and {0} lineage counts for {0} populations",
                k
            )));
        }
        if population_sizes.iter().any(|&ne| !(ne > 0.0)) {
            return Err(PhyloError::InvalidInput("population sizes must be positive".into()));
        }
        let negative = background_lineages.iter().any(|&c| !(c >= 0.0))
            || migration
                .iter()
                .enumerate()
                .any(|(i, row)| row.iter().enumerate().any(|(j, &m)| i != j && !(m >= 0.0)));
        if negative {
            return Err(PhyloError::InvalidInput(
                "migration rates and lineage counts must be non-negative".into(),
            ));
        }
        let total_emigration = migration
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(_, &m)| m)
                    .sum()
            })
            .collect();
        Ok(Self {
            migration,
            population_sizes,
            background_lineages,
            total_emigration,
        })
    }

    pub fn num_populations(&self) -> usize {
        self.population_sizes.len()
    }

    /// Initial state for a lineage sampled in `population`.
    pub fn initial_state(&self, population: usize) -> Result<Vec<f64>> {
        let k = self.num_populations();
        if population >= k {
            return Err(PhyloError::InvalidInput(format!(
                "population {} outside 0..{}",
                population, k
            )));
        }
        let mut state = vec![0.0; 2 * k];
        state[population] = 1.0;
        state[k + population] = 1.0;
        Ok(state)
    }

    /// Probability that the lineage has not coalesced, `Σ L_i`.
    pub fn no_coalescence_probability(&self, state: &[f64]) -> f64 {
        state[self.num_populations()..].iter().sum()
    }
}

impl OdeSystem for MultispeciesCoalescentMigrationOde {
    fn dimension(&self) -> usize {
        2 * self.num_populations()
    }

    fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
        let k = self.num_populations();
        let (p, l) = x.split_at(k);
        for i in 0..k {
            let (mut p_in, mut l_in) = (0.0, 0.0);
            for j in (0..k).filter(|&j| j != i) {
                p_in += self.migration[j][i] * p[j];
                l_in += self.migration[j][i] * l[j];
            }
            let coalescence = self.background_lineages[i] / self.population_sizes[i];
            dxdt[i] = p_in - self.total_emigration[i] * p[i];
            dxdt[k + i] = l_in - self.total_emigration[i] * l[i] - coalescence * l[i];
        }
    }
}
