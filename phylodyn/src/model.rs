//! Tree-valued random variables attached to the parameter graph.
//!
//! A [`TreeDistribution`] names its parameters through a [`ParameterSet`],
//! a registry of `(Role, DagNodeId)` slots. The [`Model`] dispatches every
//! touch, keep and restore to each distribution for every registered slot
//! hit by the change, and parameter swaps rewrite the registry as a whole,
//! so a distribution cannot silently lose track of a parameter it owns.

use std::fmt;

use phylodyn_core::{PhyloError, Result};
use rand::RngCore;
use tracing::debug;

use crate::graph::{DagNodeId, Graph, ParamValue};
use crate::tree::{NodeId, TimeTree};

/// The part a parameter plays in a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Origin time or root age of the process.
    StartAge,
    /// Speciation rate(s).
    Speciation,
    /// Extinction rate(s).
    Extinction,
    /// Serial (fossil) sampling rate(s).
    Fossilization,
    /// Probability of sampling an extant lineage at the present.
    SamplingFraction,
    /// Probability that sampling removes the lineage.
    Treatment,
    /// Interval breakpoints of a piecewise-constant process.
    Timeline,
    /// Burst speciation probabilities at the breakpoints.
    BurstSpeciation,
    /// Mass extinction probabilities at the breakpoints.
    MassExtinction,
    /// Event sampling probabilities at the breakpoints.
    EventSampling,
    /// Rate of switching between rate categories.
    ShiftRate,
    /// Rate of anagenetic character change.
    Anagenesis,
    /// Relative anagenetic rates between states, row-major.
    RateMatrix,
    /// State frequencies at the root.
    RootFrequencies,
}

/// Registry of the parameters a distribution depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    slots: Vec<(Role, DagNodeId)>,
}

impl ParameterSet {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `role` to `id`, replacing any previous binding.
    pub fn insert(&mut self, role: Role, id: DagNodeId) {
        match self.slots.iter_mut().find(|(r, _)| *r == role) {
            Some(slot) => slot.1 = id,
            None => self.slots.push((role, id)),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, role: Role, id: DagNodeId) -> Self {
        self.insert(role, id);
        self
    }

    /// Bind `role` only when a node is given.
    pub fn with_optional(mut self, role: Role, id: Option<DagNodeId>) -> Self {
        if let Some(id) = id {
            self.insert(role, id);
        }
        self
    }

    /// Node bound to `role`.
    ///
    /// # Errors
    ///
    /// Returns an error if the role is not registered.
    pub fn get(&self, role: Role) -> Result<DagNodeId> {
        self.optional(role)
            .ok_or_else(|| PhyloError::InvalidInput(format!("no parameter registered for {:?}", role)))
    }

    /// Node bound to `role`, if any.
    pub fn optional(&self, role: Role) -> Option<DagNodeId> {
        self.slots.iter().find(|(r, _)| *r == role).map(|(_, id)| *id)
    }

    /// Scalar value of the parameter bound to `role`.
    pub fn real(&self, graph: &Graph, role: Role) -> Result<f64> {
        graph.real(self.get(role)?)
    }

    /// Vector value of the parameter bound to `role`.
    pub fn vector<'g>(&self, graph: &'g Graph, role: Role) -> Result<&'g [f64]> {
        graph.vector(self.get(role)?)
    }

    /// Values of `role` expanded to `len` entries: a scalar is repeated, a
    /// vector must have exactly `len` entries.
    pub fn values(&self, graph: &Graph, role: Role, len: usize) -> Result<Vec<f64>> {
        match graph.value(self.get(role)?)? {
            ParamValue::Real(x) => Ok(vec![*x; len]),
            ParamValue::Vector(v) if v.len() == len => Ok(v.clone()),
            ParamValue::Vector(v) => Err(PhyloError::InvalidInput(format!(
                "{:?} has {} values, expected {}",
                role,
                v.len(),
                len
            ))),
        }
    }

    /// Like [`values`](Self::values), or `default` repeated when the role
    /// is not registered.
    pub fn values_or(&self, graph: &Graph, role: Role, len: usize, default: f64) -> Result<Vec<f64>> {
        if self.optional(role).is_some() {
            self.values(graph, role, len)
        } else {
            Ok(vec![default; len])
        }
    }

    /// Replace every slot bound to `old` by `new`. Returns how many slots
    /// changed.
    pub fn swap(&mut self, old: DagNodeId, new: DagNodeId) -> usize {
        let mut swapped = 0;
        for slot in self.slots.iter_mut().filter(|(_, id)| *id == old) {
            slot.1 = new;
            swapped += 1;
        }
        swapped
    }

    /// Roles bound to `id`.
    pub fn roles_of(&self, id: DagNodeId) -> impl Iterator<Item = Role> + '_ {
        self.slots
            .iter()
            .filter(move |(_, n)| *n == id)
            .map(|(r, _)| *r)
    }

    /// Distinct nodes in registration order.
    pub fn nodes(&self) -> Vec<DagNodeId> {
        let mut out: Vec<DagNodeId> = Vec::with_capacity(self.slots.len());
        for &(_, id) in &self.slots {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }

    /// All slots.
    pub fn iter(&self) -> impl Iterator<Item = (Role, DagNodeId)> + '_ {
        self.slots.iter().copied()
    }
}

/// A probability distribution over time trees.
///
/// The touch, keep and restore hooks are called once per registered role hit
/// by a parameter change; implementations handle the roles they cache
/// something for and treat the rest as plain invalidation.
pub trait TreeDistribution: fmt::Debug {
    /// Display name.
    fn name(&self) -> &str;

    /// Parameters the distribution depends on.
    fn parameters(&self) -> &ParameterSet;

    /// Mutable access for parameter swaps.
    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Log density of `tree` under the current parameter values.
    ///
    /// Structurally impossible trees give `f64::NEG_INFINITY`; errors are
    /// reserved for misconfigured models.
    fn ln_probability(&mut self, graph: &Graph, tree: &TimeTree) -> Result<f64>;

    /// Draw a tree from the distribution.
    fn simulate(&self, graph: &Graph, rng: &mut dyn RngCore) -> Result<TimeTree>;

    /// A parameter bound to `role` changed speculatively.
    fn touch(&mut self, role: Role, graph: &Graph, tree: &mut TimeTree) -> Result<()>;

    /// The change to `role` was accepted.
    fn keep(&mut self, role: Role);

    /// The change to `role` was rejected; `graph` already holds the old value.
    fn restore(&mut self, role: Role, graph: &Graph, tree: &mut TimeTree) -> Result<()>;

    /// Nodes of the tree changed speculatively.
    fn touch_tree(&mut self, changed: &[NodeId], tree: &TimeTree);

    /// The tree change was accepted.
    fn keep_tree(&mut self);

    /// The tree change was rejected.
    fn restore_tree(&mut self);
}

/// Handle of a tree variable inside a [`Model`].
pub type TreeHandle = usize;

#[derive(Debug)]
struct TreeVariable {
    node: DagNodeId,
    distribution: Box<dyn TreeDistribution>,
    value: TimeTree,
    stored_value: Option<TimeTree>,
    ln_prob: Option<f64>,
    stored_ln_prob: Option<Option<f64>>,
}

impl TreeVariable {
    fn save_probability(&mut self) {
        if self.stored_ln_prob.is_none() {
            self.stored_ln_prob = Some(self.ln_prob);
        }
        self.ln_prob = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Touch,
    Keep,
    Restore,
}

/// A parameter graph together with the tree variables conditioned on it.
#[derive(Debug, Default)]
pub struct Model {
    graph: Graph,
    variables: Vec<TreeVariable>,
}

impl Model {
    /// Wrap a graph whose parameter nodes are already in place.
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            variables: Vec::new(),
        }
    }

    /// The parameter graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable access for adding parameters. Values must be changed through
    /// [`set_parameter`](Self::set_parameter) so tree variables are notified.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    fn variable(&self, handle: TreeHandle) -> Result<&TreeVariable> {
        self.variables
            .get(handle)
            .ok_or_else(|| PhyloError::InvalidInput(format!("unknown tree variable {}", handle)))
    }

    fn variable_mut(&mut self, handle: TreeHandle) -> Result<&mut TreeVariable> {
        self.variables
            .get_mut(handle)
            .ok_or_else(|| PhyloError::InvalidInput(format!("unknown tree variable {}", handle)))
    }

    /// Attach a tree-valued variable. Without an observed value a tree is
    /// simulated from the distribution.
    pub fn add_tree(
        &mut self,
        name: &str,
        distribution: Box<dyn TreeDistribution>,
        value: Option<TimeTree>,
        rng: &mut dyn RngCore,
    ) -> Result<TreeHandle> {
        let node = self
            .graph
            .add_distribution_node(name, &distribution.parameters().nodes())?;
        let value = match value {
            Some(tree) => tree,
            None => distribution.simulate(&self.graph, rng)?,
        };
        self.variables.push(TreeVariable {
            node,
            distribution,
            value,
            stored_value: None,
            ln_prob: None,
            stored_ln_prob: None,
        });
        Ok(self.variables.len() - 1)
    }

    /// Current tree of a variable.
    pub fn tree(&self, handle: TreeHandle) -> Result<&TimeTree> {
        Ok(&self.variable(handle)?.value)
    }

    /// Distribution of a variable.
    pub fn distribution(&self, handle: TreeHandle) -> Result<&dyn TreeDistribution> {
        Ok(self.variable(handle)?.distribution.as_ref())
    }

    /// Graph node standing for a variable.
    pub fn tree_node(&self, handle: TreeHandle) -> Result<DagNodeId> {
        Ok(self.variable(handle)?.node)
    }

    /// Speculatively change a stochastic parameter.
    pub fn set_parameter(&mut self, id: DagNodeId, value: impl Into<ParamValue>) -> Result<()> {
        let touched = self.graph.set_value(id, value)?;
        self.dispatch(&touched, Phase::Touch)
    }

    /// Accept the pending change of a parameter.
    pub fn keep_parameter(&mut self, id: DagNodeId) -> Result<()> {
        let touched = self.graph.keep(id)?;
        self.dispatch(&touched, Phase::Keep)
    }

    /// Reject the pending change of a parameter.
    pub fn restore_parameter(&mut self, id: DagNodeId) -> Result<()> {
        let touched = self.graph.restore(id)?;
        self.dispatch(&touched, Phase::Restore)
    }

    fn dispatch(&mut self, touched: &[DagNodeId], phase: Phase) -> Result<()> {
        let graph = &self.graph;
        for var in &mut self.variables {
            let hits: Vec<_> = var
                .distribution
                .parameters()
                .iter()
                .filter(|(_, id)| touched.contains(id))
                .map(|(role, _)| role)
                .collect();
            if hits.is_empty() {
                continue;
            }
            debug!(
                distribution = var.distribution.name(),
                roles = hits.len(),
                ?phase,
                "parameter change"
            );
            match phase {
                Phase::Touch => {
                    var.save_probability();
                    for role in hits {
                        var.distribution.touch(role, graph, &mut var.value)?;
                    }
                }
                Phase::Keep => {
                    var.stored_ln_prob = None;
                    for role in hits {
                        var.distribution.keep(role);
                    }
                }
                Phase::Restore => {
                    if let Some(old) = var.stored_ln_prob.take() {
                        var.ln_prob = old;
                    }
                    for role in hits {
                        var.distribution.restore(role, graph, &mut var.value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Speculatively modify a tree. `f` returns the nodes it changed.
    pub fn update_tree<F>(&mut self, handle: TreeHandle, f: F) -> Result<()>
    where
        F: FnOnce(&mut TimeTree) -> Result<Vec<NodeId>>,
    {
        let var = self.variable_mut(handle)?;
        if var.stored_value.is_none() {
            var.stored_value = Some(var.value.clone());
        }
        var.save_probability();
        let changed = f(&mut var.value)?;
        var.distribution.touch_tree(&changed, &var.value);
        Ok(())
    }

    /// Accept the pending tree change.
    pub fn keep_tree(&mut self, handle: TreeHandle) -> Result<()> {
        let var = self.variable_mut(handle)?;
        var.stored_value = None;
        var.stored_ln_prob = None;
        var.distribution.keep_tree();
        Ok(())
    }

    /// Reject the pending tree change.
    pub fn restore_tree(&mut self, handle: TreeHandle) -> Result<()> {
        let var = self.variable_mut(handle)?;
        if let Some(mut old) = var.stored_value.take() {
            old.take_listeners_from(&mut var.value);
            var.value = old;
        }
        if let Some(p) = var.stored_ln_prob.take() {
            var.ln_prob = p;
        }
        var.distribution.restore_tree();
        Ok(())
    }

    /// Replace parameter `old` by `new` in a tree variable's distribution.
    ///
    /// # Errors
    ///
    /// Returns an error if the distribution does not use `old` or the swap
    /// would create a cycle.
    pub fn swap_parameter(&mut self, handle: TreeHandle, old: DagNodeId, new: DagNodeId) -> Result<()> {
        let node = self.variable(handle)?.node;
        if self.variable(handle)?.distribution.parameters().roles_of(old).next().is_none() {
            return Err(PhyloError::InvalidInput(format!(
                "tree variable {} does not depend on node {}",
                handle, old
            )));
        }
        self.graph.swap_parent(node, old, new)?;
        let graph = &self.graph;
        let var = self
            .variables
            .get_mut(handle)
            .ok_or_else(|| PhyloError::InvalidInput(format!("unknown tree variable {}", handle)))?;
        var.distribution.parameters_mut().swap(old, new);
        var.ln_prob = None;
        var.stored_ln_prob = None;
        let roles: Vec<Role> = var.distribution.parameters().roles_of(new).collect();
        for role in roles {
            var.distribution.touch(role, graph, &mut var.value)?;
            var.distribution.keep(role);
        }
        Ok(())
    }

    /// Replace a variable's tree by a fresh draw from its distribution.
    /// Listeners registered on the old tree move to the new one.
    pub fn redraw(&mut self, handle: TreeHandle, rng: &mut dyn RngCore) -> Result<()> {
        let graph = &self.graph;
        let var = self
            .variables
            .get_mut(handle)
            .ok_or_else(|| PhyloError::InvalidInput(format!("unknown tree variable {}", handle)))?;
        let mut fresh = var.distribution.simulate(graph, rng)?;
        fresh.take_listeners_from(&mut var.value);
        var.value = fresh;
        var.stored_value = None;
        var.ln_prob = None;
        var.stored_ln_prob = None;
        let all: Vec<NodeId> = (0..var.value.num_nodes()).collect();
        var.distribution.touch_tree(&all, &var.value);
        var.distribution.keep_tree();
        Ok(())
    }

    /// Log density of a tree variable, cached until something it depends on
    /// changes.
    pub fn ln_probability(&mut self, handle: TreeHandle) -> Result<f64> {
        let graph = &self.graph;
        let var = self
            .variables
            .get_mut(handle)
            .ok_or_else(|| PhyloError::InvalidInput(format!("unknown tree variable {}", handle)))?;
        if let Some(p) = var.ln_prob {
            return Ok(p);
        }
        let p = var.distribution.ln_probability(graph, &var.value)?;
        var.ln_prob = Some(p);
        Ok(p)
    }

    /// Sum of the log densities of every tree variable.
    pub fn total_ln_probability(&mut self) -> Result<f64> {
        let mut total = 0.0;
        for handle in 0..self.variables.len() {
            total += self.ln_probability(handle)?;
        }
        Ok(total)
    }
}
