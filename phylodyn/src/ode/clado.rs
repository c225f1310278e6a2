//! Character-dependent cladogenetic speciation-extinction ODE.
//!
//! Speciation is described by cladogenetic events `(i → j, k)` at rate
//! λ_ijk, extinction by μ_i and anagenetic change by a rate matrix `Q`
//! scaled by a clock rate. With `λ_i = Σ_jk λ_ijk` and `q_i = Σ_{j≠i} Q_ij`:
//!
//! ```text
//! dE_i/dt = μ_i - (λ_i + μ_i + q_i) E_i + Σ_{j≠i} Q_ij E_j + Σ_jk λ_ijk E_j E_k
//! dD_i/dt = -(λ_i + μ_i + q_i) D_i + Σ_{j≠i} Q_ij D_j + Σ_jk λ_ijk (D_j E_k + D_k E_j)
//! ```
//!
//! Each event with unordered daughters is listed once.

use phylodyn_core::{PhyloError, Result};

use super::OdeSystem;

/// One cladogenetic event: a lineage in `ancestor` splits into daughters in
/// `left` and `right`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CladogeneticEvent {
    pub ancestor: usize,
    pub left: usize,
    pub right: usize,
    pub rate: f64,
}

impl CladogeneticEvent {
    pub fn new(ancestor: usize, left: usize, right: usize, rate: f64) -> Self {
        Self {
            ancestor,
            left,
            right,
            rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CdCladoSeObserved {
    events: Vec<CladogeneticEvent>,
    extinction: Vec<f64>,
    // Anagenetic rates already multiplied by the clock rate; diagonal unused.
    anagenesis: Vec<Vec<f64>>,
    total_speciation: Vec<f64>,
    total_anagenesis: Vec<f64>,
}

impl CdCladoSeObserved {
    /// # Errors
    ///
    /// Returns an error if the rate matrix is not `K × K` for `K` extinction
    /// rates, if an event references a state outside `0..K`, or if any rate
    /// is negative.
    pub fn new(
        events: Vec<CladogeneticEvent>,
        extinction: Vec<f64>,
        rate_matrix: &[Vec<f64>],
        rate: f64,
    ) -> Result<Self> {
        let k = extinction.len();
        if k == 0 || rate_matrix.len() != k || rate_matrix.iter().any(|row| row.len() != k) {
            return Err(PhyloError::InvalidInput(format!(
                "rate matrix must be {0} x {0}",
                k
            )));
        }
        if let Some(e) = events
            .iter()
            .find(|e| e.ancestor >= k || e.left >= k || e.right >= k)
        {
            return Err(PhyloError::InvalidInput(format!(
                "event {:?} references a state outside 0..{}",
                e, k
            )));
        }
        let negative = events.iter().any(|e| !(e.rate >= 0.0))
            || extinction.iter().any(|&m| !(m >= 0.0))
            || !(rate >= 0.0)
            || rate_matrix
                .iter()
                .enumerate()
                .any(|(i, row)| row.iter().enumerate().any(|(j, &q)| i != j && !(q >= 0.0)));
        if negative {
            return Err(PhyloError::InvalidInput("rates must be non-negative".into()));
        }

        let anagenesis: Vec<Vec<f64>> = rate_matrix
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, &q)| if i == j { 0.0 } else { q * rate })
                    .collect()
            })
            .collect();
        let mut total_speciation = vec![0.0; k];
        for e in &events {
            total_speciation[e.ancestor] += e.rate;
        }
        let total_anagenesis = anagenesis.iter().map(|row| row.iter().sum()).collect();
        Ok(Self {
            events,
            extinction,
            anagenesis,
            total_speciation,
            total_anagenesis,
        })
    }

    /// Number of character states.
    pub fn num_states(&self) -> usize {
        self.extinction.len()
    }

    pub fn events(&self) -> &[CladogeneticEvent] {
        &self.events
    }
}

impl OdeSystem for CdCladoSeObserved {
    fn dimension(&self) -> usize {
        2 * self.num_states()
    }

    fn derivatives(&self, _t: f64, x: &[f64], dxdt: &mut [f64]) {
        let k = self.num_states();
        let (e, d) = x.split_at(k);
        for i in 0..k {
            let out = self.total_speciation[i] + self.extinction[i] + self.total_anagenesis[i];
            let (mut flow_e, mut flow_d) = (0.0, 0.0);
            for (j, &q) in self.anagenesis[i].iter().enumerate() {
                flow_e += q * e[j];
                flow_d += q * d[j];
            }
            dxdt[i] = self.extinction[i] - out * e[i] + flow_e;
            dxdt[k + i] = -out * d[i] + flow_d;
        }
        for ev in &self.events {
            let (i, l, r) = (ev.ancestor, ev.left, ev.right);
            dxdt[i] += ev.rate * e[l] * e[r];
            dxdt[k + i] += ev.rate * (d[l] * e[r] + d[r] * e[l]);
        }
    }
}
