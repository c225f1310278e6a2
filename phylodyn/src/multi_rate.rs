//! Birth-death process with hidden rate categories.
//!
//! Lineages move between `K` categories, each with its own speciation and
//! extinction rate. The tree density is computed by pruning: every branch
//! carries the `[E, D]` state of an [`OdeSystem`] integrated from the
//! younger to the older end, and the states of two children are merged at
//! their parent. Integrated branch states are kept in a [`NodeStateCache`]
//! so a proposal that changes a few node ages only re-integrates the
//! branches it touches.

use phylodyn_core::{ln_sum_exp, PhyloError, Result};
use rand::RngCore;
use tracing::{debug, trace};

use crate::birth_death::constant::simulate_divergence_time;
use crate::birth_death::{attach_ages, build_constraint_binary_tree, log_tree_topology_prob};
use crate::birth_death::{Condition, StartAge};
use crate::graph::{DagNodeId, Graph, ParamValue};
use crate::model::{ParameterSet, Role, TreeDistribution};
use crate::ode::{integrate, BiSse, IntegratorConfig, OdeSystem};
use crate::tree::{NodeId, Taxon, TimeTree, AGE_TOLERANCE};

/// Two buffers of integrated branch states per node with dirty and changed
/// flags.
///
/// A state is written to the inactive buffer the first time a node is
/// recomputed after a touch, so restoring only has to flip the buffers of
/// the changed nodes back. Dirty flags are snapshotted when the first touch
/// opens a session and put back on restore.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeStateCache {
    dim: usize,
    states: Vec<[Vec<f64>; 2]>,
    ln_scaling: Vec<[f64; 2]>,
    active: Vec<usize>,
    dirty: Vec<bool>,
    changed: Vec<bool>,
    stored_dirty: Option<Vec<bool>>,
}

impl NodeStateCache {
    /// Size the cache for `num_nodes` states of length `dim`. A cache of a
    /// different shape is rebuilt with every node dirty.
    pub(crate) fn prepare(&mut self, num_nodes: usize, dim: usize) {
        if self.dirty.len() == num_nodes && self.dim == dim {
            return;
        }
        self.dim = dim;
        self.states = vec![[vec![0.0; dim], vec![0.0; dim]]; num_nodes];
        self.ln_scaling = vec![[0.0; 2]; num_nodes];
        self.active = vec![0; num_nodes];
        self.dirty = vec![true; num_nodes];
        self.changed = vec![false; num_nodes];
        self.stored_dirty = None;
    }

    fn open_session(&mut self) {
        if self.stored_dirty.is_none() {
            self.stored_dirty = Some(self.dirty.clone());
        }
    }

    /// Mark every node dirty.
    pub(crate) fn invalidate_all(&mut self) {
        self.open_session();
        self.dirty.iter_mut().for_each(|d| *d = true);
    }

    /// Mark the changed nodes, their children and their ancestors dirty.
    pub(crate) fn invalidate_nodes(&mut self, changed: &[NodeId], tree: &TimeTree) {
        if tree.num_nodes() != self.dirty.len() {
            self.invalidate_all();
            return;
        }
        self.open_session();
        for &id in changed {
            if id >= self.dirty.len() {
                continue;
            }
            for &c in &tree.node(id).children {
                self.dirty[c] = true;
            }
            let mut current = Some(id);
            while let Some(n) = current {
                if self.dirty[n] && n != id {
                    // Dirty nodes always have dirty ancestors.
                    break;
                }
                self.dirty[n] = true;
                current = tree.node(n).parent;
            }
        }
    }

    pub(crate) fn is_dirty(&self, id: NodeId) -> bool {
        self.dirty.get(id).copied().unwrap_or(true)
    }

    pub(crate) fn state(&self, id: NodeId) -> &[f64] {
        &self.states[id][self.active[id]]
    }

    pub(crate) fn ln_scaling(&self, id: NodeId) -> f64 {
        self.ln_scaling[id][self.active[id]]
    }

    /// Store a freshly integrated state and clear the node's dirty flag.
    pub(crate) fn store(&mut self, id: NodeId, state: &[f64], ln_scale: f64) {
        if self.stored_dirty.is_some() && !self.changed[id] {
            self.active[id] ^= 1;
            self.changed[id] = true;
        }
        let buffer = self.active[id];
        self.states[id][buffer].copy_from_slice(state);
        self.ln_scaling[id][buffer] = ln_scale;
        self.dirty[id] = false;
    }

    /// Accept every state computed since the session opened.
    pub(crate) fn keep(&mut self) {
        self.stored_dirty = None;
        self.changed.iter_mut().for_each(|c| *c = false);
    }

    /// Return to the states held when the session opened.
    pub(crate) fn restore(&mut self) {
        if let Some(dirty) = self.stored_dirty.take() {
            for (id, changed) in self.changed.iter_mut().enumerate() {
                if *changed {
                    self.active[id] ^= 1;
                    *changed = false;
                }
            }
            self.dirty = dirty;
        }
    }
}

/// Per-evaluation description of what happens on and between branches.
pub(crate) trait BranchProcess {
    type System: OdeSystem;

    /// ODE integrated along every branch.
    fn system(&self) -> &Self::System;

    /// `[E, D]` at a tip.
    fn tip_state(&self, tree: &TimeTree, id: NodeId) -> Result<Vec<f64>>;

    /// `[E, D]` just below a bifurcation, from the states at the top of its
    /// two child branches.
    fn combine(&self, left: &[f64], right: &[f64]) -> Vec<f64>;
}

/// Re-integrate every dirty branch below the root in postorder.
///
/// After integration the `D` half of a state is divided by its maximum and
/// the log of the factor recorded, so densities do not underflow on deep
/// trees.
pub(crate) fn update_branches<B: BranchProcess>(
    cache: &mut NodeStateCache,
    tree: &TimeTree,
    process: &B,
    config: &IntegratorConfig,
) -> Result<usize> {
    let k = process.system().dimension() / 2;
    let mut recomputed = 0;
    for id in tree.iter_postorder() {
        let node = tree.node(id);
        let parent = match node.parent {
            Some(p) => p,
            None => continue,
        };
        if !cache.is_dirty(id) {
            continue;
        }
        let mut state = if node.is_tip() {
            process.tip_state(tree, id)?
        } else {
            process.combine(cache.state(node.children[0]), cache.state(node.children[1]))
        };
        integrate(process.system(), &mut state, node.age, tree.node(parent).age, config)?;

        let max = state[k..].iter().copied().fold(0.0, f64::max);
        let ln_scale = if max > 0.0 && max.is_finite() {
            state[k..].iter_mut().for_each(|d| *d /= max);
            max.ln()
        } else if max == 0.0 {
            f64::NEG_INFINITY
        } else {
            f64::NAN
        };
        cache.store(id, &state, ln_scale);
        recomputed += 1;
    }
    Ok(recomputed)
}

/// Sum of the recorded scaling factors below the root.
pub(crate) fn total_ln_scaling(cache: &NodeStateCache, tree: &TimeTree) -> f64 {
    (0..tree.num_nodes())
        .filter(|&id| id != tree.root())
        .map(|id| cache.ln_scaling(id))
        .sum()
}

/// Root age matches the parameter, every child is strictly younger than its
/// parent, every tip is extant and the root is a bifurcation.
pub(crate) fn ages_valid(tree: &TimeTree, root_age: f64) -> bool {
    if tree.node(tree.root()).children.len() != 2 {
        return false;
    }
    if (tree.root_age() - root_age).abs() > AGE_TOLERANCE {
        debug!(tree = tree.root_age(), parameter = root_age, "root age mismatch");
        return false;
    }
    if let Some(tip) = tree.tips().find(|&id| tree.node(id).age > AGE_TOLERANCE) {
        debug!(tip, age = tree.node(tip).age, "tips must be extant");
        return false;
    }
    tree.nodes().iter().all(|node| match node.parent {
        Some(p) => node.age < tree.node(p).age,
        None => true,
    })
}

/// Number of entries of a scalar or vector parameter.
pub(crate) fn num_entries(params: &ParameterSet, graph: &Graph, role: Role) -> Result<usize> {
    Ok(match graph.value(params.get(role)?)? {
        ParamValue::Real(_) => 1,
        ParamValue::Vector(v) => v.len(),
    })
}

/// Root frequencies, uniform when not given.
pub(crate) fn root_frequencies(params: &ParameterSet, graph: &Graph, k: usize) -> Result<Vec<f64>> {
    let pi = params.values_or(graph, Role::RootFrequencies, k, 1.0 / k as f64)?;
    if pi.iter().any(|&p| !(p >= 0.0)) {
        return Err(PhyloError::InvalidInput("root frequencies must be non-negative".into()));
    }
    Ok(pi)
}

pub(crate) fn sampling_fraction(params: &ParameterSet, graph: &Graph) -> Result<f64> {
    let rho = params.real(graph, Role::SamplingFraction)?;
    if !(0.0..=1.0).contains(&rho) {
        return Err(PhyloError::InvalidInput(format!(
            "sampling fraction {} outside [0, 1]",
            rho
        )));
    }
    Ok(rho)
}

/// Parameter nodes of a [`MultiRateBirthDeathProcess`].
#[derive(Debug, Clone, Copy)]
pub struct MultiRateParameters {
    /// Age of the root; must match the tree.
    pub root_age: DagNodeId,
    /// Speciation rate per category (a scalar means one category).
    pub speciation: DagNodeId,
    /// Extinction rate per category, or one rate shared by all.
    pub extinction: DagNodeId,
    /// Rate η of switching between categories along a branch.
    pub shift_rate: DagNodeId,
    /// Probability ρ that an extant lineage is in the tree.
    pub sampling_fraction: DagNodeId,
    /// Category frequencies at the root; uniform when absent.
    pub root_frequencies: Option<DagNodeId>,
}

#[derive(Debug)]
struct MultiRateBranches {
    system: BiSse,
    rho: f64,
}

impl BranchProcess for MultiRateBranches {
    type System = BiSse;

    fn system(&self) -> &BiSse {
        &self.system
    }

    fn tip_state(&self, _tree: &TimeTree, _id: NodeId) -> Result<Vec<f64>> {
        let k = self.system.num_categories();
        let mut state = vec![1.0 - self.rho; 2 * k];
        state[k..].iter_mut().for_each(|d| *d = self.rho);
        Ok(state)
    }

    fn combine(&self, left: &[f64], right: &[f64]) -> Vec<f64> {
        let k = self.system.num_categories();
        let mut state = left.to_vec();
        for (i, &lambda) in self.system.speciation().iter().enumerate() {
            state[k + i] = left[k + i] * right[k + i] * lambda;
        }
        state
    }
}

/// Birth-death process whose rates depend on a hidden category.
#[derive(Debug, Clone)]
pub struct MultiRateBirthDeathProcess {
    condition: Condition,
    taxa: Vec<Taxon>,
    params: ParameterSet,
    integrator: IntegratorConfig,
    cache: NodeStateCache,
}

impl MultiRateBirthDeathProcess {
    /// # Errors
    ///
    /// Returns an error when conditioning on the number of taxa or when
    /// taxon names repeat.
    pub fn new(parameters: MultiRateParameters, condition: Condition, taxa: Vec<Taxon>) -> Result<Self> {
        if condition == Condition::NumTaxa {
            return Err(PhyloError::InvalidInput(
                "MultiRateBirthDeathProcess conditions on time or survival only".into(),
            ));
        }
        for (i, taxon) in taxa.iter().enumerate() {
            if taxa[..i].iter().any(|t| t.name == taxon.name) {
                return Err(PhyloError::InvalidInput(format!(
                    "taxon '{}' appears twice",
                    taxon.name
                )));
            }
        }
        let params = ParameterSet::new()
            .with(Role::StartAge, parameters.root_age)
            .with(Role::Speciation, parameters.speciation)
            .with(Role::Extinction, parameters.extinction)
            .with(Role::ShiftRate, parameters.shift_rate)
            .with(Role::SamplingFraction, parameters.sampling_fraction)
            .with_optional(Role::RootFrequencies, parameters.root_frequencies);
        Ok(Self {
            condition,
            taxa,
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

    /// Time or survival conditioning.
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Extant taxa the tree is drawn on.
    pub fn taxa(&self) -> &[Taxon] {
        &self.taxa
    }

    /// Cached `[E, D]` at the top of a node's branch, if it is up to date.
    /// `D` is rescaled.
    pub fn node_state(&self, id: NodeId) -> Option<&[f64]> {
        if self.cache.is_dirty(id) {
            None
        } else {
            Some(self.cache.state(id))
        }
    }

    fn branches(&self, graph: &Graph) -> Result<MultiRateBranches> {
        let k = num_entries(&self.params, graph, Role::Speciation)?;
        let system = BiSse::new(
            self.params.values(graph, Role::Speciation, k)?,
            self.params.values(graph, Role::Extinction, k)?,
            self.params.real(graph, Role::ShiftRate)?,
        )?;
        Ok(MultiRateBranches {
            system,
            rho: sampling_fraction(&self.params, graph)?,
        })
    }

    /// Root likelihood `ln Σ π_i D_left,i D_right,i`, before scaling.
    fn root_likelihood(&self, tree: &TimeTree, pi: &[f64]) -> (f64, f64) {
        let k = pi.len();
        let children = &tree.node(tree.root()).children;
        let left = self.cache.state(children[0]);
        let right = self.cache.state(children[1]);
        let mut likelihood = Vec::with_capacity(k);
        let mut survival = Vec::with_capacity(k);
        for (i, &p) in pi.iter().enumerate() {
            likelihood.push(p.ln() + left[k + i].ln() + right[k + i].ln());
            survival.push(p.ln() + 2.0 * (1.0 - left[i]).abs().ln());
        }
        (ln_sum_exp(&likelihood), ln_sum_exp(&survival))
    }

    /// Log density of `tree`, re-integrating only dirty branches.
    pub fn compute_ln_probability(&mut self, graph: &Graph, tree: &TimeTree) -> Result<f64> {
        let root_age = self.params.real(graph, Role::StartAge)?;
        if !ages_valid(tree, root_age) {
            return Ok(f64::NEG_INFINITY);
        }
        let branches = self.branches(graph)?;
        let k = branches.system.num_categories();
        let pi = root_frequencies(&self.params, graph, k)?;

        self.cache.prepare(tree.num_nodes(), 2 * k);
        let recomputed = update_branches(&mut self.cache, tree, &branches, &self.integrator)?;

        let (ln_root, ln_survival) = self.root_likelihood(tree, &pi);
        let mut ln_prob = ln_root + total_ln_scaling(&self.cache, tree);
        if self.condition == Condition::Survival {
            if ln_survival == f64::NEG_INFINITY {
                return Ok(f64::NEG_INFINITY);
            }
            ln_prob -= ln_survival;
        }
        ln_prob += log_tree_topology_prob(tree.num_tips());
        trace!(ln_prob, recomputed, categories = k, "multi-rate birth-death density");
        Ok(ln_prob)
    }

    /// Draw a tree under constant rates equal to the root-frequency
    /// weighted means of the category rates.
    pub fn simulate_tree(&self, graph: &Graph, rng: &mut dyn RngCore) -> Result<TimeTree> {
        let branches = self.branches(graph)?;
        let k = branches.system.num_categories();
        let pi = root_frequencies(&self.params, graph, k)?;
        let lambda = weighted_mean(branches.system.speciation(), &pi);
        let mu = weighted_mean(&self.params.values(graph, Role::Extinction, k)?, &pi);
        let root_age = self.params.real(graph, Role::StartAge)?;
        simulate_root_conditioned(&self.taxa, root_age, lambda, mu, branches.rho, rng)
    }
}

pub(crate) fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    values.iter().zip(weights.iter()).map(|(v, w)| v * w).sum()
}

/// Random topology below a root of age `root_age`, with divergence ages
/// drawn under constant rates.
pub(crate) fn simulate_root_conditioned(
    taxa: &[Taxon],
    root_age: f64,
    lambda: f64,
    mu: f64,
    rho: f64,
    rng: &mut dyn RngCore,
) -> Result<TimeTree> {
    let n = taxa.len();
    if n < 2 {
        return Err(PhyloError::InvalidInput(
            "simulating a tree needs at least two taxa".into(),
        ));
    }
    if let Some(t) = taxa.iter().find(|t| t.age >= root_age) {
        return Err(PhyloError::InvalidInput(format!(
            "taxon '{}' (age {}) is not younger than the root age {}",
            t.name, t.age, root_age
        )));
    }
    let (mut nodes, root) = build_constraint_binary_tree(taxa, &[], rng)?;
    let mut times: Vec<f64> = (0..n - 2)
        .map(|_| simulate_divergence_time(lambda, mu, rho, root_age, rng))
        .collect();
    times.sort_by(|a, b| a.total_cmp(b));
    attach_ages(&mut nodes, root, &times, StartAge::RootAge, root_age, rng);
    TimeTree::from_unordered(nodes, root)
}

impl TreeDistribution for MultiRateBirthDeathProcess {
    fn name(&self) -> &str {
        "MultiRateBirthDeathProcess"
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
