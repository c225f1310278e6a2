//! Parameter dependency graph with speculative touch/keep/restore updates.
//!
//! Nodes live in an arena and refer to each other by [`DagNodeId`]. Each node
//! lists its parents (the values it is computed from or conditioned on) and
//! its children, the nodes affected when its value changes. A change is
//! pushed breadth-first along the children; deterministic nodes in the
//! affected set are recomputed in dependency order and keep their previous
//! value so the whole sweep can be rolled back.

use std::collections::VecDeque;
use std::fmt;

use phylodyn_core::{PhyloError, Result};
use tracing::trace;

/// Index into the graph's node arena.
pub type DagNodeId = usize;

/// Value held by a parameter node.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamValue {
    /// A scalar.
    Real(f64),
    /// A vector of scalars (rates per interval or per category, frequencies).
    Vector(Vec<f64>),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Real(_) => "real",
            ParamValue::Vector(_) => "vector",
        }
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Real(x)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::Vector(v)
    }
}

/// Function computing a deterministic node from its parents' values.
pub type DeterministicFn = Box<dyn Fn(&[&ParamValue]) -> Result<ParamValue>>;

/// Role of a node in the graph.
pub enum NodeKind {
    /// Fixed value; never touched.
    Constant,
    /// Value drawn or proposed by an external move.
    Stochastic,
    /// Value recomputed from the parents.
    Deterministic(DeterministicFn),
    /// Tree-valued stochastic node whose value is held by the model.
    Distribution,
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Constant => "Constant",
            NodeKind::Stochastic => "Stochastic",
            NodeKind::Deterministic(_) => "Deterministic",
            NodeKind::Distribution => "Distribution",
        };
        f.write_str(name)
    }
}

/// A node of the dependency graph.
#[derive(Debug)]
pub struct DagNode {
    /// Display name.
    pub name: String,
    kind: NodeKind,
    value: Option<ParamValue>,
    stored: Option<ParamValue>,
    parents: Vec<DagNodeId>,
    children: Vec<DagNodeId>,
    dirty: bool,
}

impl DagNode {
    /// The node's kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Nodes this one is computed from.
    pub fn parents(&self) -> &[DagNodeId] {
        &self.parents
    }

    /// Nodes affected when this one changes.
    pub fn children(&self) -> &[DagNodeId] {
        &self.children
    }

    /// True between a touch and the matching keep or restore.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn is_stochastic(&self) -> bool {
        matches!(self.kind, NodeKind::Stochastic | NodeKind::Distribution)
    }
}

/// Arena of parameter nodes.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<DagNode>,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, name: &str, kind: NodeKind, value: Option<ParamValue>) -> DagNodeId {
        let id = self.nodes.len();
        self.nodes.push(DagNode {
            name: name.to_owned(),
            kind,
            value,
            stored: None,
            parents: Vec::new(),
            children: Vec::new(),
            dirty: false,
        });
        id
    }

    /// Add a fixed-value node.
    pub fn add_constant(&mut self, name: &str, value: impl Into<ParamValue>) -> DagNodeId {
        self.push(name, NodeKind::Constant, Some(value.into()))
    }

    /// Add a node whose value is set by external moves.
    pub fn add_stochastic(&mut self, name: &str, value: impl Into<ParamValue>) -> DagNodeId {
        self.push(name, NodeKind::Stochastic, Some(value.into()))
    }

    /// Add a node computed from `parents` by `f`.
    ///
    /// # Errors
    ///
    /// Returns an error if a parent is unknown or `f` fails on the current
    /// parent values.
    pub fn add_deterministic<F>(
        &mut self,
        name: &str,
        parents: &[DagNodeId],
        f: F,
    ) -> Result<DagNodeId>
    where
        F: Fn(&[&ParamValue]) -> Result<ParamValue> + 'static,
    {
        self.check_ids(parents)?;
        let value = {
            let args = self.parent_values(parents)?;
            f(&args)?
        };
        let id = self.push(name, NodeKind::Deterministic(Box::new(f)), Some(value));
        self.link(id, parents);
        Ok(id)
    }

    /// Add a tree-valued stochastic node conditioned on `parents`.
    pub fn add_distribution_node(
        &mut self,
        name: &str,
        parents: &[DagNodeId],
    ) -> Result<DagNodeId> {
        self.check_ids(parents)?;
        let id = self.push(name, NodeKind::Distribution, None);
        self.link(id, parents);
        Ok(id)
    }

    fn link(&mut self, id: DagNodeId, parents: &[DagNodeId]) {
        self.nodes[id].parents = parents.to_vec();
        let mut unique = parents.to_vec();
        unique.sort_unstable();
        unique.dedup();
        for p in unique {
            self.nodes[p].children.push(id);
        }
    }

    fn check_ids(&self, ids: &[DagNodeId]) -> Result<()> {
        for &id in ids {
            if id >= self.nodes.len() {
                return Err(PhyloError::Graph(format!(
                    "unknown node {} (graph has {})",
                    id,
                    self.nodes.len()
                )));
            }
        }
        Ok(())
    }

    fn parent_values(&self, parents: &[DagNodeId]) -> Result<Vec<&ParamValue>> {
        parents.iter().map(|&p| self.value(p)).collect()
    }

    /// Access a node.
    pub fn node(&self, id: DagNodeId) -> Result<&DagNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| PhyloError::Graph(format!("unknown node {}", id)))
    }

    /// Current value of a parameter node.
    pub fn value(&self, id: DagNodeId) -> Result<&ParamValue> {
        let node = self.node(id)?;
        node.value
            .as_ref()
            .ok_or_else(|| PhyloError::Graph(format!("node '{}' holds no parameter value", node.name)))
    }

    /// Current value of a scalar node.
    pub fn real(&self, id: DagNodeId) -> Result<f64> {
        match self.value(id)? {
            ParamValue::Real(x) => Ok(*x),
            other => Err(PhyloError::Graph(format!(
                "node '{}' holds a {}, expected a real",
                self.nodes[id].name,
                other.kind()
            ))),
        }
    }

    /// Current value of a vector node.
    pub fn vector(&self, id: DagNodeId) -> Result<&[f64]> {
        match self.value(id)? {
            ParamValue::Vector(v) => Ok(v),
            other => Err(PhyloError::Graph(format!(
                "node '{}' holds a {}, expected a vector",
                self.nodes[id].name,
                other.kind()
            ))),
        }
    }

    /// True between a touch and the matching keep or restore.
    pub fn is_dirty(&self, id: DagNodeId) -> Result<bool> {
        Ok(self.node(id)?.dirty)
    }

    /// Speculatively change a stochastic node and touch it.
    ///
    /// The previous value is kept until [`keep`](Self::keep) or
    /// [`restore`](Self::restore). Returns the touched closure.
    ///
    /// # Errors
    ///
    /// Returns an error for non-stochastic nodes or a change of value kind.
    pub fn set_value(&mut self, id: DagNodeId, value: impl Into<ParamValue>) -> Result<Vec<DagNodeId>> {
        let value = value.into();
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| PhyloError::Graph(format!("unknown node {}", id)))?;
        if !matches!(node.kind, NodeKind::Stochastic) {
            return Err(PhyloError::Graph(format!(
                "cannot set the value of {:?} node '{}'",
                node.kind, node.name
            )));
        }
        let old = node.value.replace(value);
        if let (Some(old), Some(new)) = (&old, &node.value) {
            if std::mem::discriminant(old) != std::mem::discriminant(new) {
                let msg = format!(
                    "node '{}' changed from {} to {}",
                    node.name,
                    old.kind(),
                    new.kind()
                );
                node.value = Some(old.clone());
                return Err(PhyloError::Graph(msg));
            }
        }
        if node.stored.is_none() {
            node.stored = old;
        }
        self.touch(id)
    }

    /// Nodes reachable from `id` along children, `id` first, breadth-first.
    fn closure(&self, id: DagNodeId) -> Vec<DagNodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);
        seen[id] = true;
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for &c in &self.nodes[n].children {
                if !seen[c] {
                    seen[c] = true;
                    queue.push_back(c);
                }
            }
        }
        order
    }

    /// Order the closure of `id` so every node follows its parents.
    fn topological_closure(&self, id: DagNodeId) -> Vec<DagNodeId> {
        let members = self.closure(id);
        let mut in_set = vec![false; self.nodes.len()];
        for &m in &members {
            in_set[m] = true;
        }
        let mut pending = vec![0usize; self.nodes.len()];
        for &m in &members {
            if m != id {
                let mut parents = self.nodes[m].parents.clone();
                parents.sort_unstable();
                parents.dedup();
                pending[m] = parents.iter().filter(|&&p| in_set[p]).count();
            }
        }
        let mut order = Vec::with_capacity(members.len());
        let mut queue = VecDeque::from([id]);
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for &c in &self.nodes[n].children {
                pending[c] -= 1;
                if pending[c] == 0 {
                    queue.push_back(c);
                }
            }
        }
        order
    }

    /// Mark `id` and everything depending on it dirty, recomputing the
    /// deterministic nodes on the way. Returns the touched nodes in
    /// dependency order.
    pub fn touch(&mut self, id: DagNodeId) -> Result<Vec<DagNodeId>> {
        self.check_ids(&[id])?;
        let order = self.topological_closure(id);
        for &n in &order {
            self.nodes[n].dirty = true;
            if n == id {
                continue;
            }
            if let NodeKind::Deterministic(f) = &self.nodes[n].kind {
                let parents = self.nodes[n].parents.clone();
                let value = {
                    let args = self.parent_values(&parents)?;
                    f(&args)?
                };
                let node = &mut self.nodes[n];
                let old = node.value.replace(value);
                if node.stored.is_none() {
                    node.stored = old;
                }
            }
        }
        trace!(node = %self.nodes[id].name, touched = order.len(), "touch");
        Ok(order)
    }

    /// Commit the speculative change at `id`. Returns the committed nodes.
    pub fn keep(&mut self, id: DagNodeId) -> Result<Vec<DagNodeId>> {
        self.check_ids(&[id])?;
        let order = self.topological_closure(id);
        for &n in &order {
            let node = &mut self.nodes[n];
            node.stored = None;
            node.dirty = false;
        }
        trace!(node = %self.nodes[id].name, kept = order.len(), "keep");
        Ok(order)
    }

    /// Roll back the speculative change at `id`. Returns the restored nodes.
    pub fn restore(&mut self, id: DagNodeId) -> Result<Vec<DagNodeId>> {
        self.check_ids(&[id])?;
        let order = self.topological_closure(id);
        for &n in &order {
            let node = &mut self.nodes[n];
            if let Some(old) = node.stored.take() {
                node.value = Some(old);
            }
            node.dirty = false;
        }
        trace!(node = %self.nodes[id].name, restored = order.len(), "restore");
        Ok(order)
    }

    /// Stochastic and tree-valued nodes whose density depends on `id`,
    /// directly or through deterministic nodes, in ascending order.
    pub fn affected_nodes(&self, id: DagNodeId) -> Result<Vec<DagNodeId>> {
        self.check_ids(&[id])?;
        let mut out: Vec<DagNodeId> = self
            .closure(id)
            .into_iter()
            .filter(|&n| n != id && self.nodes[n].is_stochastic())
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// True if `to` can be reached from `from` along children.
    pub fn depends_on(&self, to: DagNodeId, from: DagNodeId) -> bool {
        from < self.nodes.len() && self.closure(from).contains(&to)
    }

    /// Replace every `old` parent of `child` by `new`.
    ///
    /// Deterministic nodes downstream of `child` are recomputed and the
    /// change is committed immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if `old` is not a parent of `child` or if the new
    /// edge would create a cycle.
    pub fn swap_parent(&mut self, child: DagNodeId, old: DagNodeId, new: DagNodeId) -> Result<()> {
        self.check_ids(&[child, old, new])?;
        if !self.nodes[child].parents.contains(&old) {
            return Err(PhyloError::Graph(format!(
                "'{}' is not a parent of '{}'",
                self.nodes[old].name, self.nodes[child].name
            )));
        }
        if old == new {
            return Ok(());
        }
        if new == child || self.depends_on(new, child) {
            return Err(PhyloError::Graph(format!(
                "connecting '{}' to '{}' would create a cycle",
                self.nodes[new].name, self.nodes[child].name
            )));
        }
        for p in self.nodes[child].parents.iter_mut() {
            if *p == old {
                *p = new;
            }
        }
        self.nodes[old].children.retain(|&c| c != child);
        if !self.nodes[new].children.contains(&child) {
            self.nodes[new].children.push(child);
        }
        if let NodeKind::Deterministic(f) = &self.nodes[child].kind {
            let parents = self.nodes[child].parents.clone();
            let value = {
                let args = self.parent_values(&parents)?;
                f(&args)?
            };
            self.nodes[child].value = Some(value);
        }
        self.touch(child)?;
        self.keep(child)?;
        Ok(())
    }
}
