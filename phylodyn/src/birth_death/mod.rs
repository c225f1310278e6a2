//! Birth-death tree priors.
//!
//! [`BirthDeathProcess`] holds everything the birth-death family shares:
//! the start-age parameter (origin or root age), the conditioning, clade
//! constraints, the topology constant, the tree-validity checks and the
//! constrained tree simulator. The regime-specific density of the node ages
//! is supplied by a [`BirthDeathModel`]:
//!
//! - [`fossilized`]: constant rates with fossils and sampled ancestors
//! - [`serial_sampled`]: constant rates, sampling removes the lineage
//! - [`episodic`]: piecewise-constant rates with bursts and mass extinctions

pub mod constant;
pub mod episodic;
pub mod fossilized;
pub mod serial_sampled;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use phylodyn_core::{ln_factorial, PhyloError, Result};
use rand::{Rng, RngCore};
use tracing::{debug, trace};

use crate::graph::{DagNodeId, Graph};
use crate::model::{ParameterSet, Role, TreeDistribution};
use crate::tree::{Clade, NodeId, Taxon, TimeTree, TreeNode, AGE_TOLERANCE};

pub use episodic::{
    EpisodicBirthDeathSamplingTreatmentProcess, EpisodicParameters, EpisodicSamplingTreatment,
    Intervals,
};
pub use fossilized::{ConstantRateFossilizedBirthDeathProcess, FossilizedBirthDeath};
pub use serial_sampled::{ConstantRateSerialSampledBirthDeathProcess, SerialSampledBirthDeath};

/// Event the density is conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    /// No conditioning beyond the start time.
    #[default]
    Time,
    /// At least one sampled descendant (of each root lineage).
    Survival,
    /// The observed number of extant taxa.
    NumTaxa,
}

impl FromStr for Condition {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "time" => Ok(Condition::Time),
            "survival" => Ok(Condition::Survival),
            "nTaxa" => Ok(Condition::NumTaxa),
            other => Err(PhyloError::Parse(format!(
                "unknown condition '{}' (expected time, survival or nTaxa)",
                other
            ))),
        }
    }
}

/// Whether the process starts with one lineage at the origin or two at the
/// root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StartAge {
    /// One lineage at the origin time, older than the root.
    Origin,
    /// Two lineages at the root age.
    RootAge,
}

impl StartAge {
    /// Number of lineages the process starts with.
    pub fn num_initial_lineages(self) -> usize {
        match self {
            StartAge::Origin => 1,
            StartAge::RootAge => 2,
        }
    }
}

/// Settings shared by every birth-death process.
#[derive(Debug, Clone, Default)]
pub struct BirthDeathSettings {
    /// Origin-time parameter; exclusive with `root_age`.
    pub origin: Option<DagNodeId>,
    /// Root-age parameter; exclusive with `origin`.
    pub root_age: Option<DagNodeId>,
    /// Conditioning of the density.
    pub condition: Condition,
    /// Taxa of the trees the process describes.
    pub taxa: Vec<Taxon>,
    /// Clades required to be monophyletic.
    pub constraints: Vec<Clade>,
}

/// Everything a model needs to evaluate the density of the node ages.
#[derive(Debug, Clone, Copy)]
pub struct TimesContext<'a> {
    /// Parameter values.
    pub graph: &'a Graph,
    /// Parameter registry of the process.
    pub params: &'a ParameterSet,
    /// Tree being evaluated.
    pub tree: &'a TimeTree,
    /// Whether the process starts at the origin or the root.
    pub start: StartAge,
    /// Value of the start-age parameter.
    pub start_age: f64,
}

/// Regime-specific part of a birth-death process.
pub trait BirthDeathModel: fmt::Debug {
    /// Display name.
    fn name(&self) -> &'static str;

    /// Whether trees may contain sampled ancestors.
    fn allows_sampled_ancestors(&self) -> bool;

    /// Whether [`ln_prob_num_taxa`](Self::ln_prob_num_taxa) has a closed form.
    fn supports_num_taxa(&self) -> bool {
        false
    }

    /// Whether clade constraints may carry missing taxa.
    fn supports_incomplete_clades(&self) -> bool {
        false
    }

    /// Log probability that one taxon missing from a clade with MRCA age
    /// `clade_age` belongs below that MRCA.
    fn ln_missing_in_clade(
        &self,
        _params: &ParameterSet,
        _graph: &Graph,
        _clade_age: f64,
        _start_age: f64,
    ) -> Result<f64> {
        Err(PhyloError::InvalidInput(format!(
            "{} cannot account for taxa missing from clades",
            self.name()
        )))
    }

    /// Per-evaluation precomputation, called before any check.
    fn prepare(&mut self, _params: &ParameterSet, _graph: &Graph, _tree: &TimeTree) -> Result<()> {
        Ok(())
    }

    /// Log density of the node ages.
    fn ln_prob_times(&self, ctx: &TimesContext<'_>) -> Result<f64>;

    /// Probability that a lineage alive at age `end` leaves at least one
    /// sampled descendant by age `start` (`start < end`).
    fn p_survival(&self, params: &ParameterSet, graph: &Graph, start: f64, end: f64) -> Result<f64>;

    /// Log probability of sampling exactly `n` extant taxa.
    fn ln_prob_num_taxa(
        &self,
        _params: &ParameterSet,
        _graph: &Graph,
        _n: usize,
        _start_age: f64,
        _start: StartAge,
    ) -> Result<f64> {
        Err(PhyloError::InvalidInput(format!(
            "{} cannot condition on the number of taxa",
            self.name()
        )))
    }

    /// Draw one divergence age in `(0, start_age)`.
    fn simulate_divergence_time(
        &self,
        params: &ParameterSet,
        graph: &Graph,
        start_age: f64,
        rng: &mut dyn RngCore,
    ) -> Result<f64>;
}

/// A birth-death tree prior: shared machinery around a [`BirthDeathModel`].
#[derive(Debug, Clone)]
pub struct BirthDeathProcess<M> {
    start: StartAge,
    condition: Condition,
    taxa: Vec<Taxon>,
    constraints: Vec<Clade>,
    log_tree_topology_prob: f64,
    params: ParameterSet,
    model: M,
}

/// `(n-1) ln 2 - ln n!`: log probability of one labelled ranked topology
/// relative to the ordered histories a birth-death process generates.
pub fn log_tree_topology_prob(num_taxa: usize) -> f64 {
    if num_taxa == 0 {
        return 0.0;
    }
    (num_taxa as f64 - 1.0) * std::f64::consts::LN_2 - ln_factorial(num_taxa)
}

impl<M: BirthDeathModel> BirthDeathProcess<M> {
    /// Assemble a process from shared settings, a model and the model's
    /// parameters.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly one of origin and root age is given,
    /// when the model cannot honour the requested conditioning, when taxon
    /// names repeat, or when clade constraints reference unknown taxa or
    /// overlap without nesting.
    pub fn with_model(settings: BirthDeathSettings, model: M, params: ParameterSet) -> Result<Self> {
        let (start, start_node) = match (settings.origin, settings.root_age) {
            (Some(o), None) => (StartAge::Origin, o),
            (None, Some(r)) => (StartAge::RootAge, r),
            (Some(_), Some(_)) => {
                return Err(PhyloError::InvalidInput(
                    "give either an origin time or a root age, not both".into(),
                ))
            }
            (None, None) => {
                return Err(PhyloError::InvalidInput(
                    "an origin time or a root age is required".into(),
                ))
            }
        };
        if settings.condition == Condition::NumTaxa && !model.supports_num_taxa() {
            return Err(PhyloError::InvalidInput(format!(
                "{} cannot condition on the number of taxa",
                model.name()
            )));
        }

        let mut names = BTreeSet::new();
        for taxon in &settings.taxa {
            if !names.insert(taxon.name.as_str()) {
                return Err(PhyloError::InvalidInput(format!(
                    "taxon '{}' appears twice",
                    taxon.name
                )));
            }
        }
        let mut constraints = settings.constraints;
        constraints.sort();
        for (i, clade) in constraints.iter().enumerate() {
            if let Some(missing) = clade.taxa().iter().find(|t| !names.contains(t.as_str())) {
                return Err(PhyloError::InvalidInput(format!(
                    "clade constraint references unknown taxon '{}'",
                    missing
                )));
            }
            if clade.num_missing > 0 && !model.supports_incomplete_clades() {
                return Err(PhyloError::InvalidInput(format!(
                    "{} cannot account for {} taxa missing from clade {:?}",
                    model.name(),
                    clade.num_missing,
                    clade.taxa()
                )));
            }
            for other in &constraints[i + 1..] {
                if !other.is_superset(clade) && !other.is_disjoint(clade) {
                    return Err(PhyloError::InvalidInput(format!(
                        "clade constraints {:?} and {:?} overlap without nesting",
                        clade.taxa(),
                        other.taxa()
                    )));
                }
            }
        }

        let params = params.with(Role::StartAge, start_node);
        Ok(Self {
            start,
            condition: settings.condition,
            log_tree_topology_prob: log_tree_topology_prob(settings.taxa.len()),
            taxa: settings.taxa,
            constraints,
            params,
            model,
        })
    }

    /// Whether the process starts at the origin or at the root.
    pub fn start(&self) -> StartAge {
        self.start
    }

    /// Conditioning of the density.
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Taxa of the process.
    pub fn taxa(&self) -> &[Taxon] {
        &self.taxa
    }

    /// Clade constraints in their deterministic order.
    pub fn constraints(&self) -> &[Clade] {
        &self.constraints
    }

    /// The precomputed topology constant.
    pub fn log_tree_topology_prob(&self) -> f64 {
        self.log_tree_topology_prob
    }

    /// The regime-specific model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Value of the start-age parameter.
    pub fn start_age(&self, graph: &Graph) -> Result<f64> {
        self.params.real(graph, Role::StartAge)
    }

    /// Log density of `tree`: validity checks, conditioning, node ages and
    /// the topology constant.
    pub fn compute_ln_probability(&mut self, graph: &Graph, tree: &TimeTree) -> Result<f64> {
        self.model.prepare(&self.params, graph, tree)?;

        if !self.constraints.is_empty() {
            let sets = tree.tip_sets();
            for clade in &self.constraints {
                if !sets.iter().any(|s| s == clade.taxa()) {
                    debug!(clade = ?clade.taxa(), "clade constraint violated");
                    return Ok(f64::NEG_INFINITY);
                }
            }
        }

        let start_age = self.start_age(graph)?;
        let root_age = tree.root_age();
        match self.start {
            StartAge::Origin if root_age > start_age => {
                debug!(root_age, origin = start_age, "root older than the origin");
                return Ok(f64::NEG_INFINITY);
            }
            StartAge::RootAge if (root_age - start_age).abs() > AGE_TOLERANCE => {
                debug!(root_age, expected = start_age, "root age differs from its parameter");
                return Ok(f64::NEG_INFINITY);
            }
            _ => {}
        }
        if !self.ages_consistent(tree) {
            return Ok(f64::NEG_INFINITY);
        }

        let mut ln_prob = 0.0;
        match self.condition {
            Condition::Time => {}
            Condition::Survival => {
                let p = self.model.p_survival(&self.params, graph, 0.0, start_age)?;
                if p <= 0.0 || p.is_nan() {
                    debug!(p, "survival is impossible");
                    return Ok(f64::NEG_INFINITY);
                }
                let lineages = self.start.num_initial_lineages() as f64;
                ln_prob -= lineages * p.ln();
            }
            Condition::NumTaxa => {
                let n = tree
                    .tips()
                    .filter(|&id| tree.node(id).age <= AGE_TOLERANCE)
                    .count();
                let lp = self
                    .model
                    .ln_prob_num_taxa(&self.params, graph, n, start_age, self.start)?;
                if lp == f64::NEG_INFINITY || lp.is_nan() {
                    debug!(n, "observed number of taxa is impossible");
                    return Ok(f64::NEG_INFINITY);
                }
                ln_prob -= lp;
            }
        }

        let ctx = TimesContext {
            graph,
            params: &self.params,
            tree,
            start: self.start,
            start_age,
        };
        let times = self.model.ln_prob_times(&ctx)?;
        if times.is_nan() {
            return Ok(f64::NAN);
        }
        ln_prob += times;
        for clade in self.constraints.iter().filter(|c| c.num_missing > 0) {
            let Some(mrca) = tree.clade_node(clade) else { continue };
            let ln_missing =
                self.model
                    .ln_missing_in_clade(&self.params, graph, tree.node(mrca).age, start_age)?;
            ln_prob += clade.num_missing as f64 * ln_missing;
        }
        ln_prob += self.log_tree_topology_prob;
        trace!(model = self.model.name(), ln_prob, "birth-death density");
        Ok(ln_prob)
    }

    fn ages_consistent(&self, tree: &TimeTree) -> bool {
        for node in tree.nodes() {
            let Some(parent) = node.parent else { continue };
            let parent_age = tree.node(parent).age;
            if node.sampled_ancestor {
                if !self.model.allows_sampled_ancestors() {
                    debug!(node = node.index, "sampled ancestors are not allowed");
                    return false;
                }
                if (node.age - parent_age).abs() > AGE_TOLERANCE {
                    debug!(node = node.index, "sampled ancestor on a non-zero branch");
                    return false;
                }
            } else if node.age >= parent_age {
                debug!(node = node.index, age = node.age, parent_age, "child not younger than parent");
                return false;
            }
        }
        true
    }

    /// Draw ages for `n` divergences, sorted ascending.
    pub fn sim_speciations(
        &self,
        graph: &Graph,
        n: usize,
        start_age: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>> {
        let mut times = (0..n)
            .map(|_| {
                self.model
                    .simulate_divergence_time(&self.params, graph, start_age, rng)
            })
            .collect::<Result<Vec<f64>>>()?;
        times.sort_by(|a, b| a.total_cmp(b));
        Ok(times)
    }

    /// Simulate a tree honouring the clade constraints.
    ///
    /// The topology is drawn first, then divergence ages from
    /// [`sim_speciations`](Self::sim_speciations) are attached from the root
    /// down so every child is younger than its parent.
    ///
    /// # Errors
    ///
    /// Returns an error with fewer than two taxa or a taxon not younger than
    /// the start age.
    pub fn simulate_tree(&self, graph: &Graph, rng: &mut dyn RngCore) -> Result<TimeTree> {
        let n = self.taxa.len();
        if n < 2 {
            return Err(PhyloError::InvalidInput(
                "simulating a tree needs at least two taxa".into(),
            ));
        }
        let start_age = self.start_age(graph)?;
        if let Some(t) = self.taxa.iter().find(|t| t.age >= start_age) {
            return Err(PhyloError::InvalidInput(format!(
                "taxon '{}' (age {}) is not younger than the start age {}",
                t.name, t.age, start_age
            )));
        }

        let (mut nodes, root) = build_constraint_binary_tree(&self.taxa, &self.constraints, rng)?;

        let num_initial = self.start.num_initial_lineages();
        let times = self.sim_speciations(graph, n - num_initial, start_age, rng)?;
        attach_ages(&mut nodes, root, &times, self.start, start_age, rng);

        TimeTree::from_unordered(nodes, root)
    }

    /// Times of the divergences below the root, measured forward from the
    /// start of the process, ascending.
    pub fn divergence_times_since_origin(&self, graph: &Graph, tree: &TimeTree) -> Result<Vec<f64>> {
        let start_age = self.start_age(graph)?;
        let mut times: Vec<f64> = tree
            .internal_nodes()
            .filter(|&id| id != tree.root() && !tree.has_sampled_ancestor_child(id))
            .map(|id| start_age - tree.node(id).age)
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));
        Ok(times)
    }

    /// Number of lineages alive `t` time units after the start: two plus the
    /// divergences strictly before `t`.
    pub fn diversity(&self, graph: &Graph, tree: &TimeTree, t: f64) -> Result<usize> {
        let times = self.divergence_times_since_origin(graph, tree)?;
        Ok(2 + times.iter().take_while(|&&x| x < t).count())
    }
}

/// Ages of the true bifurcations relative to the youngest tip, ascending.
pub fn ages_of_internal_nodes_from_most_recent_sample(tree: &TimeTree) -> Vec<f64> {
    let youngest = youngest_tip_age(tree);
    let mut ages: Vec<f64> = tree
        .internal_nodes()
        .filter(|&id| !tree.has_sampled_ancestor_child(id))
        .map(|id| tree.node(id).age - youngest)
        .collect();
    ages.sort_by(|a, b| a.total_cmp(b));
    ages
}

/// Ages of the tips relative to the youngest tip, ascending.
pub fn ages_of_tips_from_most_recent_sample(tree: &TimeTree) -> Vec<f64> {
    let youngest = youngest_tip_age(tree);
    let mut ages: Vec<f64> = tree.tips().map(|id| tree.node(id).age - youngest).collect();
    ages.sort_by(|a, b| a.total_cmp(b));
    ages
}

fn youngest_tip_age(tree: &TimeTree) -> f64 {
    tree.tips()
        .map(|id| tree.node(id).age)
        .fold(f64::INFINITY, f64::min)
}

/// Draw a binary topology in which every clade is monophyletic.
///
/// Clades are processed smallest first. A clade's exclusive members are the
/// subtrees already built for its nested clades plus its remaining tips;
/// they are joined in random pairs until one subtree stands for the clade.
/// The remaining subtrees are then paired up to the root. Internal node ages
/// are left at zero. Returns the nodes and the root index.
pub fn build_constraint_binary_tree(
    taxa: &[Taxon],
    constraints: &[Clade],
    rng: &mut dyn RngCore,
) -> Result<(Vec<TreeNode>, NodeId)> {
    let mut nodes: Vec<TreeNode> = taxa.iter().cloned().map(TreeNode::tip).collect();
    let index: HashMap<&str, NodeId> = taxa
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();
    // Topmost built subtree containing each tip.
    let mut top: Vec<NodeId> = (0..taxa.len()).collect();

    let mut sorted: Vec<&Clade> = constraints.iter().collect();
    sorted.sort();
    for clade in sorted {
        let mut tips = Vec::with_capacity(clade.len());
        for name in clade.taxa() {
            let tip = *index.get(name.as_str()).ok_or_else(|| {
                PhyloError::InvalidInput(format!("clade references unknown taxon '{}'", name))
            })?;
            tips.push(tip);
        }
        let mut members: Vec<NodeId> = tips.iter().map(|&t| top[t]).collect();
        members.sort_unstable();
        members.dedup();
        let clade_root = pair_randomly(&mut nodes, members, rng)?;
        for t in tips {
            top[t] = clade_root;
        }
    }

    let mut remaining = top;
    remaining.sort_unstable();
    remaining.dedup();
    let root = pair_randomly(&mut nodes, remaining, rng)?;
    Ok((nodes, root))
}

/// Attach divergence ages (ascending) to the internal nodes of a drawn
/// topology, oldest first from the root down, then move any node that is not
/// older than its oldest tip between that tip and its parent.
pub(crate) fn attach_ages(
    nodes: &mut [TreeNode],
    root: NodeId,
    times: &[f64],
    start: StartAge,
    start_age: f64,
    rng: &mut dyn RngCore,
) {
    let mut frontier = match start {
        StartAge::RootAge => {
            nodes[root].age = start_age;
            internal_children(nodes, root)
        }
        StartAge::Origin => vec![root],
    };
    for &t in times.iter().rev() {
        let pick = rng.gen_range(0..frontier.len());
        let id = frontier.swap_remove(pick);
        nodes[id].age = t;
        frontier.extend(internal_children(nodes, id));
    }
    debug_assert!(frontier.is_empty(), "every internal node receives an age");

    // Tips sampled in the past may be older than the drawn ages; push
    // such nodes between their oldest tip and their parent.
    let mut oldest_tip = vec![0.0f64; nodes.len()];
    let mut order = vec![root];
    let mut i = 0;
    while i < order.len() {
        let id = order[i];
        order.extend(nodes[id].children.iter().copied());
        i += 1;
    }
    for &id in order.iter().rev() {
        oldest_tip[id] = if nodes[id].children.is_empty() {
            nodes[id].age
        } else {
            nodes[id]
                .children
                .iter()
                .map(|&c| oldest_tip[c])
                .fold(0.0, f64::max)
        };
    }
    for &id in &order {
        if nodes[id].children.is_empty() {
            continue;
        }
        let upper = match nodes[id].parent {
            Some(p) => nodes[p].age,
            None if start == StartAge::RootAge => continue,
            None => start_age,
        };
        let lower = oldest_tip[id];
        let age = nodes[id].age;
        if age <= lower || age >= upper {
            let repaired = lower + (upper - lower) * rng.gen_range(0.1..0.9);
            trace!(node = id, age, repaired, "repairing simulated age");
            nodes[id].age = repaired;
        }
    }
}

fn internal_children(nodes: &[TreeNode], id: NodeId) -> Vec<NodeId> {
    nodes[id]
        .children
        .iter()
        .copied()
        .filter(|&c| !nodes[c].children.is_empty())
        .collect()
}

fn pair_randomly(
    nodes: &mut Vec<TreeNode>,
    mut pool: Vec<NodeId>,
    rng: &mut dyn RngCore,
) -> Result<NodeId> {
    while pool.len() > 1 {
        let a = pool.swap_remove(rng.gen_range(0..pool.len()));
        let b = pool.swap_remove(rng.gen_range(0..pool.len()));
        let id = nodes.len();
        nodes.push(TreeNode::internal(vec![a, b], 0.0));
        nodes[a].parent = Some(id);
        nodes[b].parent = Some(id);
        pool.push(id);
    }
    pool.first()
        .copied()
        .ok_or_else(|| PhyloError::InvalidInput("cannot build a tree without taxa".into()))
}

impl<M: BirthDeathModel> TreeDistribution for BirthDeathProcess<M> {
    fn name(&self) -> &str {
        self.model.name()
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
            Role::StartAge if self.start == StartAge::RootAge => {
                tree.set_root_age(self.start_age(graph)?)
            }
            // The closed-form densities are recomputed on every evaluation.
            _ => Ok(()),
        }
    }

    fn keep(&mut self, _role: Role) {}

    fn restore(&mut self, role: Role, graph: &Graph, tree: &mut TimeTree) -> Result<()> {
        // The graph already holds the old value; pushing it again rolls the
        // root back.
        self.touch(role, graph, tree)
    }

    fn touch_tree(&mut self, _changed: &[NodeId], _tree: &TimeTree) {}

    fn keep_tree(&mut self) {}

    fn restore_tree(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const BALANCED: &str = "((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);";

    struct Nodes {
        graph: Graph,
        start: DagNodeId,
        lambda: DagNodeId,
        mu: DagNodeId,
        psi: DagNodeId,
        rho: DagNodeId,
    }

    fn nodes(start_age: f64) -> Nodes {
        let mut graph = Graph::new();
        Nodes {
            start: graph.add_stochastic("start", start_age),
            lambda: graph.add_stochastic("lambda", 1.0),
            mu: graph.add_stochastic("mu", 0.3),
            psi: graph.add_stochastic("psi", 0.0),
            rho: graph.add_constant("rho", 1.0),
            graph,
        }
    }

    fn taxa(names: &[&str]) -> Vec<Taxon> {
        names.iter().map(|&n| Taxon::new(n)).collect()
    }

    fn fbd(n: &Nodes, settings: BirthDeathSettings) -> Result<ConstantRateFossilizedBirthDeathProcess> {
        BirthDeathProcess::fossilized(settings, n.lambda, n.mu, n.psi, n.rho)
    }

    fn origin_settings(n: &Nodes, names: &[&str], condition: Condition) -> BirthDeathSettings {
        BirthDeathSettings {
            origin: Some(n.start),
            condition,
            taxa: taxa(names),
            ..Default::default()
        }
    }

    #[test]
    fn topology_constant_counts_ranked_histories() {
        for n in 2..=6usize {
            let ln_fact = |k: usize| (1..=k).map(|x| (x as f64).ln()).sum::<f64>();
            let ln_pairs: f64 = (2..=n).map(|k| ((k * (k - 1) / 2) as f64).ln()).sum();
            let expected = ln_fact(n - 1) - ln_pairs;
            assert!((log_tree_topology_prob(n) - expected).abs() < 1e-10, "n = {}", n);
        }
    }

    #[test]
    fn condition_from_str() {
        assert_eq!("time".parse::<Condition>().unwrap(), Condition::Time);
        assert_eq!("survival".parse::<Condition>().unwrap(), Condition::Survival);
        assert_eq!("nTaxa".parse::<Condition>().unwrap(), Condition::NumTaxa);
        assert!("ntaxa".parse::<Condition>().is_err());
    }

    #[test]
    fn exactly_one_start_age() {
        let n = nodes(2.0);
        let both = BirthDeathSettings {
            origin: Some(n.start),
            root_age: Some(n.start),
            taxa: taxa(&["A", "B"]),
            ..Default::default()
        };
        assert!(matches!(fbd(&n, both), Err(PhyloError::InvalidInput(_))));
        let neither = BirthDeathSettings {
            taxa: taxa(&["A", "B"]),
            ..Default::default()
        };
        assert!(matches!(fbd(&n, neither), Err(PhyloError::InvalidInput(_))));
    }

    #[test]
    fn constructor_validates_taxa_and_clades() {
        let n = nodes(2.0);
        assert!(fbd(&n, origin_settings(&n, &["A", "A"], Condition::Time)).is_err());

        let mut overlapping = origin_settings(&n, &["A", "B", "C", "D"], Condition::Time);
        overlapping.constraints = vec![
            Clade::new(["A", "B"]).unwrap(),
            Clade::new(["B", "C"]).unwrap(),
        ];
        assert!(fbd(&n, overlapping).is_err());

        let mut unknown = origin_settings(&n, &["A", "B", "C"], Condition::Time);
        unknown.constraints = vec![Clade::new(["A", "Z"]).unwrap()];
        assert!(fbd(&n, unknown).is_err());

        let mut nested = origin_settings(&n, &["A", "B", "C", "D"], Condition::Time);
        nested.constraints = vec![
            Clade::new(["A", "B", "C"]).unwrap(),
            Clade::new(["A", "B"]).unwrap(),
        ];
        let p = fbd(&n, nested).unwrap();
        assert_eq!(p.constraints()[0].len(), 2);
    }

    #[test]
    fn end_to_end_balanced_tree() {
        let n = nodes(2.0);
        let mut tree = TimeTree::from_newick(BALANCED).unwrap();
        let mut p = fbd(&n, origin_settings(&n, &["A", "B", "C", "D"], Condition::Survival)).unwrap();
        let lp = p.ln_probability(&n.graph, &tree).unwrap();
        assert!(lp.is_finite() && lp < 0.0, "{}", lp);

        // A tip older than its parent is a zero-probability tree.
        tree.set_age(0, 0.9).unwrap();
        assert_eq!(p.ln_probability(&n.graph, &tree).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn start_age_must_match_the_tree() {
        let tree = TimeTree::from_newick(BALANCED).unwrap();

        let young = nodes(1.2);
        let mut p = fbd(&young, origin_settings(&young, &["A", "B", "C", "D"], Condition::Time)).unwrap();
        assert_eq!(p.ln_probability(&young.graph, &tree).unwrap(), f64::NEG_INFINITY);

        let wrong_root = nodes(1.6);
        let settings = BirthDeathSettings {
            root_age: Some(wrong_root.start),
            taxa: taxa(&["A", "B", "C", "D"]),
            ..Default::default()
        };
        let mut p = fbd(&wrong_root, settings).unwrap();
        assert_eq!(p.ln_probability(&wrong_root.graph, &tree).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn violated_clade_is_impossible() {
        let n = nodes(2.0);
        let tree = TimeTree::from_newick(BALANCED).unwrap();
        let mut settings = origin_settings(&n, &["A", "B", "C", "D"], Condition::Time);
        settings.constraints = vec![Clade::new(["A", "C"]).unwrap()];
        let mut p = fbd(&n, settings).unwrap();
        assert_eq!(p.ln_probability(&n.graph, &tree).unwrap(), f64::NEG_INFINITY);

        let mut settings = origin_settings(&n, &["A", "B", "C", "D"], Condition::Time);
        settings.constraints = vec![Clade::new(["A", "B"]).unwrap()];
        let mut p = fbd(&n, settings).unwrap();
        assert!(p.ln_probability(&n.graph, &tree).unwrap().is_finite());
    }

    #[test]
    fn missing_clade_taxa_attach_below_the_mrca() {
        let n = nodes(2.0);
        let tree = TimeTree::from_newick("((A:1.0,B:1.0):0.5,C:1.5);").unwrap();
        let complete = {
            let mut settings = origin_settings(&n, &["A", "B", "C"], Condition::Time);
            settings.constraints = vec![Clade::new(["A", "B"]).unwrap()];
            fbd(&n, settings).unwrap().ln_probability(&n.graph, &tree).unwrap()
        };
        let mut settings = origin_settings(&n, &["A", "B", "C"], Condition::Time);
        settings.constraints = vec![Clade::new(["A", "B"]).unwrap().with_missing(2)];
        let incomplete = fbd(&n, settings).unwrap().ln_probability(&n.graph, &tree).unwrap();

        let ln_f = constant::ln_missing_lineage_prob(1.0, 0.3, 1.0, 2.0);
        assert!(ln_f < 0.0);
        assert!((incomplete - complete - 2.0 * ln_f).abs() < 1e-12);
    }

    #[test]
    fn missing_lineage_under_pure_birth() {
        // Yule: the extra split time below age t has CDF proportional to 1 - exp(-λt).
        let expected = ((1.0 - (-1.5f64).exp()) / (1.0 - (-3.0f64).exp())).ln();
        let got = constant::ln_missing_lineage_prob(1.5, 0.0, 1.0, 2.0);
        assert!((got - expected).abs() < 1e-12, "{} vs {}", got, expected);
    }

    #[test]
    fn constrained_simulations_respect_every_clade() {
        let n = nodes(5.0);
        let names = ["A", "B", "C", "D", "E", "F", "G", "H"];
        let mut settings = origin_settings(&n, &names, Condition::Time);
        let clades = vec![
            Clade::new(["A", "B", "C"]).unwrap(),
            Clade::new(["A", "B"]).unwrap(),
            Clade::new(["E", "F", "G", "H"]).unwrap(),
            Clade::new(["G", "H"]).unwrap(),
        ];
        settings.constraints = clades.clone();
        let mut p = fbd(&n, settings).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let tree = p.simulate_tree(&n.graph, &mut rng).unwrap();
            assert_eq!(tree.num_tips(), names.len());
            for clade in &clades {
                assert!(tree.contains_clade(clade), "{:?} not monophyletic", clade.taxa());
            }
            assert!(tree.root_age() < 5.0);
            assert!(p.ln_probability(&n.graph, &tree).unwrap().is_finite());
        }
    }

    #[test]
    fn simulated_root_takes_the_root_age() {
        let n = nodes(3.0);
        let settings = BirthDeathSettings {
            root_age: Some(n.start),
            taxa: taxa(&["A", "B", "C", "D", "E"]),
            ..Default::default()
        };
        let mut p = fbd(&n, settings).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let tree = p.simulate_tree(&n.graph, &mut rng).unwrap();
            assert_eq!(tree.root_age(), 3.0);
            assert!(p.ln_probability(&n.graph, &tree).unwrap().is_finite());
        }
    }

    #[test]
    fn simulation_places_nodes_above_old_tips() {
        let mut n = nodes(4.0);
        n.psi = n.graph.add_stochastic("psi_positive", 0.5);
        let mut names = taxa(&["A", "B", "C"]);
        names.push(Taxon::with_age("F1", 2.5));
        names.push(Taxon::with_age("F2", 3.2));
        let settings = BirthDeathSettings {
            origin: Some(n.start),
            taxa: names,
            ..Default::default()
        };
        let mut p = fbd(&n, settings).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let tree = p.simulate_tree(&n.graph, &mut rng).unwrap();
            for node in tree.nodes() {
                if let Some(parent) = node.parent {
                    assert!(node.age < tree.node(parent).age);
                }
            }
            assert!(tree.root_age() < 4.0);
            assert!(p.ln_probability(&n.graph, &tree).unwrap().is_finite());
        }
    }

    #[test]
    fn simulation_rejects_bad_taxa() {
        let n = nodes(2.0);
        let p = fbd(&n, origin_settings(&n, &["A"], Condition::Time)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(p.simulate_tree(&n.graph, &mut rng).is_err());

        let settings = BirthDeathSettings {
            origin: Some(n.start),
            taxa: vec![Taxon::new("A"), Taxon::with_age("B", 2.5)],
            ..Default::default()
        };
        let p = fbd(&n, settings).unwrap();
        assert!(p.simulate_tree(&n.graph, &mut rng).is_err());
    }

    #[test]
    fn divergence_helpers() {
        let n = nodes(2.0);
        let tree = TimeTree::from_newick("(((A:0.5,B:0.5):0.5,C:1.0):1.0,D:2.0);").unwrap();
        let p = fbd(&n, origin_settings(&n, &["A", "B", "C", "D"], Condition::Time)).unwrap();
        // Internal ages 0.5, 1.0 and the root at 2.0; origin at 2.0.
        let times = p.divergence_times_since_origin(&n.graph, &tree).unwrap();
        assert_eq!(times.len(), 2);
        assert!((times[0] - 1.0).abs() < 1e-12);
        assert!((times[1] - 1.5).abs() < 1e-12);
        assert_eq!(p.diversity(&n.graph, &tree, 0.5).unwrap(), 2);
        assert_eq!(p.diversity(&n.graph, &tree, 1.2).unwrap(), 3);
        assert_eq!(p.diversity(&n.graph, &tree, 1.9).unwrap(), 4);

        let internal = ages_of_internal_nodes_from_most_recent_sample(&tree);
        assert_eq!(internal.len(), 3);
        assert!((internal[2] - 2.0).abs() < 1e-12);
        let tips = ages_of_tips_from_most_recent_sample(&tree);
        assert!(tips.iter().all(|&a| a.abs() < 1e-12));
    }

    #[test]
    fn constraint_tree_pairs_within_clades() {
        let names = taxa(&["A", "B", "C", "D", "E"]);
        let clades = vec![Clade::new(["C", "D", "E"]).unwrap()];
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let (nodes, root) = build_constraint_binary_tree(&names, &clades, &mut rng).unwrap();
            assert_eq!(nodes.len(), 9);
            let mut nodes = nodes;
            // Give internal nodes distinct ages so the tree is valid.
            for (i, node) in nodes.iter_mut().enumerate() {
                if !node.children.is_empty() {
                    node.age = i as f64;
                }
            }
            let tree = TimeTree::from_unordered(nodes, root).unwrap();
            assert!(tree.contains_clade(&clades[0]));
        }
    }

    #[test]
    fn constraint_tree_needs_taxa() {
        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(
            build_constraint_binary_tree(&[], &[], &mut rng),
            Err(PhyloError::InvalidInput(_))
        ));
        let (nodes, root) = build_constraint_binary_tree(&taxa(&["A"]), &[], &mut rng).unwrap();
        assert_eq!((nodes.len(), root), (1, 0));
    }

    #[test]
    fn root_age_touch_moves_the_root() {
        let n = nodes(1.5);
        let settings = BirthDeathSettings {
            root_age: Some(n.start),
            taxa: taxa(&["A", "B", "C", "D"]),
            ..Default::default()
        };
        let mut p = fbd(&n, settings).unwrap();
        let mut graph = n.graph;
        let mut tree = TimeTree::from_newick(BALANCED).unwrap();

        graph.set_value(n.start, 1.7).unwrap();
        p.touch(Role::StartAge, &graph, &mut tree).unwrap();
        assert_eq!(tree.root_age(), 1.7);
        assert!(p.ln_probability(&graph, &tree).unwrap().is_finite());

        graph.restore(n.start).unwrap();
        p.restore(Role::StartAge, &graph, &mut tree).unwrap();
        assert_eq!(tree.root_age(), 1.5);
    }
}
