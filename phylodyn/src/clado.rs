//! Character-dependent birth-death process with cladogenetic state change.
//!
//! Each taxon carries an observed discrete character. Lineages change state
//! along branches (anagenesis) and at speciation, where an ancestor in state
//! `i` splits into daughters in states `j` and `k` at rate λ_ijk. Branches
//! are integrated with [`CdCladoSeObserved`]; at a bifurcation
//!
//! ```text
//! D_i = Σ_jk λ_ijk (D_left,j D_right,k + D_left,k D_right,j) / 2
//! ```
//!
//! and the root contributes `ln Σ_i π_i D_i`. Branch states share the
//! two-buffer cache of the multi-rate process.

use std::collections::HashMap;

use phylodyn_core::{ln_sum_exp, PhyloError, Result};
use rand::RngCore;
use tracing::trace;

use crate::birth_death::{log_tree_topology_prob, Condition};
use crate::graph::{DagNodeId, Graph};
use crate::model::{ParameterSet, Role, TreeDistribution};
use crate::multi_rate::{
    ages_valid, num_entries, root_frequencies, sampling_fraction, simulate_root_conditioned,
    total_ln_scaling, update_branches, weighted_mean, BranchProcess, NodeStateCache,
};
use crate::ode::{CdCladoSeObserved, CladogeneticEvent, IntegratorConfig};
use crate::tree::{NodeId, Taxon, TimeTree};

/// Parameter nodes of a [`CharacterDependentCladoBirthDeathProcess`].
#[derive(Debug, Clone, Copy)]
pub struct CladoParameters {
    /// Age of the root; must match the tree.
    pub root_age: DagNodeId,
    /// One rate per cladogenetic event, in event order (a scalar is shared).
    pub speciation: DagNodeId,
    /// Extinction rate per state; its length sets the number of states.
    pub extinction: DagNodeId,
    /// `K × K` anagenetic rate matrix, row-major; the diagonal is ignored.
    pub rate_matrix: DagNodeId,
    /// Clock rate scaling the rate matrix.
    pub clock_rate: DagNodeId,
    /// Probability ρ that an extant lineage is in the tree.
    pub sampling_fraction: DagNodeId,
    /// State frequencies at the root; uniform when absent.
    pub root_frequencies: Option<DagNodeId>,
}

#[derive(Debug)]
struct CladoBranches<'a> {
    system: CdCladoSeObserved,
    rho: f64,
    tip_states: &'a HashMap<String, Option<usize>>,
}

impl CladoBranches<'_> {
    fn speciation_density(&self, left: &[f64], right: &[f64]) -> Vec<f64> {
        let k = self.system.num_states();
        let mut d = vec![0.0; k];
        for e in self.system.events() {
            let (l, r) = (k + e.left, k + e.right);
            d[e.ancestor] += e.rate * (left[l] * right[r] + left[r] * right[l]) / 2.0;
        }
        d
    }
}

impl BranchProcess for CladoBranches<'_> {
    type System = CdCladoSeObserved;

    fn system(&self) -> &CdCladoSeObserved {
        &self.system
    }

    fn tip_state(&self, tree: &TimeTree, id: NodeId) -> Result<Vec<f64>> {
        let k = self.system.num_states();
        let name = tree.node(id).name().unwrap_or_default();
        let observed = *self
            .tip_states
            .get(name)
            .ok_or_else(|| PhyloError::InvalidInput(format!("no character data for tip '{}'", name)))?;
        if let Some(s) = observed.filter(|&s| s >= k) {
            return Err(PhyloError::InvalidInput(format!(
                "tip '{}' is in state {} but the model has {} states",
                name, s, k
            )));
        }
        let mut state = vec![1.0 - self.rho; 2 * k];
        for (j, d) in state[k..].iter_mut().enumerate() {
            *d = match observed {
                Some(s) if s != j => 0.0,
                _ => self.rho,
            };
        }
        Ok(state)
    }

    fn combine(&self, left: &[f64], right: &[f64]) -> Vec<f64> {
        let k = self.system.num_states();
        let mut state = left.to_vec();
        state[k..].copy_from_slice(&self.speciation_density(left, right));
        state
    }
}

/// Birth-death process with state-dependent cladogenetic and anagenetic
/// change of an observed character.
#[derive(Debug, Clone)]
pub struct CharacterDependentCladoBirthDeathProcess {
    taxa: Vec<Taxon>,
    tip_states: HashMap<String, Option<usize>>,
    event_states: Vec<(usize, usize, usize)>,
    params: ParameterSet,
    integrator: IntegratorConfig,
    cache: NodeStateCache,
}

impl CharacterDependentCladoBirthDeathProcess {
    /// `event_states` lists the `(ancestor, left, right)` states of every
    /// cladogenetic event; `tip_states` gives each taxon's observed state,
    /// `None` for missing data.
    ///
    /// # Errors
    ///
    /// Returns an error for conditions other than time, an empty event list
    /// or repeated taxa.
    pub fn new(
        parameters: CladoParameters,
        event_states: Vec<(usize, usize, usize)>,
        tip_states: Vec<(Taxon, Option<usize>)>,
        condition: Condition,
    ) -> Result<Self> {
        if condition != Condition::Time {
            return Err(PhyloError::InvalidInput(
                "CharacterDependentCladoBirthDeathProcess conditions on time only".into(),
            ));
        }
        if event_states.is_empty() {
            return Err(PhyloError::InvalidInput("no cladogenetic events given".into()));
        }
        let mut taxa = Vec::with_capacity(tip_states.len());
        let mut states = HashMap::with_capacity(tip_states.len());
        for (taxon, state) in tip_states {
            if states.insert(taxon.name.clone(), state).is_some() {
                return Err(PhyloError::InvalidInput(format!(
                    "taxon '{}' appears twice",
                    taxon.name
                )));
            }
            taxa.push(taxon);
        }
        let params = ParameterSet::new()
            .with(Role::StartAge, parameters.root_age)
            .with(Role::Speciation, parameters.speciation)
            .with(Role::Extinction, parameters.extinction)
            .with(Role::RateMatrix, parameters.rate_matrix)
            .with(Role::Anagenesis, parameters.clock_rate)
            .with(Role::SamplingFraction, parameters.sampling_fraction)
            .with_optional(Role::RootFrequencies, parameters.root_frequencies);
        Ok(Self {
            taxa,
            tip_states: states,
            event_states,
            params,
            integrator: IntegratorConfig::default().with_clamping(true),
            cache: NodeStateCache::default(),
        })
    }

    /// Replace the branch integrator.
    pub fn with_integrator(mut self, config: IntegratorConfig) -> Self {
        self.integrator = config;
        self
    }

    /// Extant taxa the tree is drawn on.
    pub fn taxa(&self) -> &[Taxon] {
        &self.taxa
    }

    /// Observed state of a taxon; `Some(None)` for missing data.
    pub fn tip_state(&self, name: &str) -> Option<Option<usize>> {
        self.tip_states.get(name).copied()
    }

    fn system(&self, graph: &Graph) -> Result<CdCladoSeObserved> {
        let k = num_entries(&self.params, graph, Role::Extinction)?;
        let extinction = self.params.values(graph, Role::Extinction, k)?;
        let rates = self.params.values(graph, Role::Speciation, self.event_states.len())?;
        let events = self
            .event_states
            .iter()
            .zip(rates)
            .map(|(&(i, j, l), rate)| CladogeneticEvent::new(i, j, l, rate))
            .collect();
        let flat = self.params.values(graph, Role::RateMatrix, k * k)?;
        let matrix: Vec<Vec<f64>> = flat.chunks(k).map(<[f64]>::to_vec).collect();
        let clock = self.params.real(graph, Role::Anagenesis)?;
        CdCladoSeObserved::new(events, extinction, &matrix, clock)
    }

    /// Log density of `tree` and its tip states.
    pub fn compute_ln_probability(&mut self, graph: &Graph, tree: &TimeTree) -> Result<f64> {
        let root_age = self.params.real(graph, Role::StartAge)?;
        if !ages_valid(tree, root_age) {
            return Ok(f64::NEG_INFINITY);
        }
        let branches = CladoBranches {
            system: self.system(graph)?,
            rho: sampling_fraction(&self.params, graph)?,
            tip_states: &self.tip_states,
        };
        let k = branches.system.num_states();
        let pi = root_frequencies(&self.params, graph, k)?;

        self.cache.prepare(tree.num_nodes(), 2 * k);
        let recomputed = update_branches(&mut self.cache, tree, &branches, &self.integrator)?;

        let children = &tree.node(tree.root()).children;
        let root = branches.speciation_density(
            self.cache.state(children[0]),
            self.cache.state(children[1]),
        );
        let terms: Vec<f64> = pi.iter().zip(root.iter()).map(|(p, d)| p.ln() + d.ln()).collect();
        let ln_prob = ln_sum_exp(&terms)
            + total_ln_scaling(&self.cache, tree)
            + log_tree_topology_prob(tree.num_tips());
        trace!(ln_prob, recomputed, states = k, "cladogenetic birth-death density");
        Ok(ln_prob)
    }

    /// Draw a tree under constant rates equal to the root-frequency
    /// weighted mean total speciation and extinction rates. Tip states are
    /// not simulated.
    pub fn simulate_tree(&self, graph: &Graph, rng: &mut dyn RngCore) -> Result<TimeTree> {
        let system = self.system(graph)?;
        let k = system.num_states();
        let pi = root_frequencies(&self.params, graph, k)?;
        let mut speciation = vec![0.0; k];
        for e in system.events() {
            speciation[e.ancestor] += e.rate;
        }
        let extinction = self.params.values(graph, Role::Extinction, k)?;
        simulate_root_conditioned(
            &self.taxa,
            self.params.real(graph, Role::StartAge)?,
            weighted_mean(&speciation, &pi),
            weighted_mean(&extinction, &pi),
            sampling_fraction(&self.params, graph)?,
            rng,
        )
    }
}

impl TreeDistribution for CharacterDependentCladoBirthDeathProcess {
    fn name(&self) -> &str {
        "CharacterDependentCladoBirthDeathProcess"
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn ln_probability(&mut self, graph: &Graph, tree: &TimeTree) -> Result<f64> {
        self.compute_ln_probability(graph, tree)
    }

    fn simulate(&self, graph: &Graph, rng: &mut dyn RngCore) -> Result<TimeTree> {
        self.simulate_tree(graph, rng)
    }

    fn touch(&mut self, role: Role, graph: &Graph, tree: &mut TimeTree) -> Result<()> {
        match role {
            Role::StartAge => {
                tree.set_root_age(self.params.real(graph, Role::StartAge)?)?;
                self.cache.invalidate_nodes(&[tree.root()], tree);
            }
            _ => self.cache.invalidate_all(),
        }
        Ok(())
    }

    fn keep(&mut self, _role: Role) {
        self.cache.keep();
    }

    fn restore(&mut self, role: Role, graph: &Graph, tree: &mut TimeTree) -> Result<()> {
        if role == Role::StartAge {
            tree.set_root_age(self.params.real(graph, Role::StartAge)?)?;
        }
        self.cache.restore();
        Ok(())
    }

    fn touch_tree(&mut self, changed: &[NodeId], tree: &TimeTree) {
        self.cache.invalidate_nodes(changed, tree);
    }

    fn keep_tree(&mut self) {
        self.cache.keep();
    }

    fn restore_tree(&mut self) {
        self.cache.restore();
    }
}
