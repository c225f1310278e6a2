//! Time-calibrated phylogenetic trees.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<TreeNode>` and are
//! referenced by `NodeId` (a `usize` index). For a tree with `n` tips the
//! tips occupy indices `0..n` and the internal nodes `n..2n-1`, with the root
//! last. Ages are measured backwards from the present.
//!
//! A sampled ancestor is stored the way it is observed: a fossil tip hanging
//! off a bifurcation on a zero-length branch. The bifurcation is then not a
//! real speciation event, which the birth-death densities take into account.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use phylodyn_core::{PhyloError, Result};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Two ages closer than this are treated as equal.
pub const AGE_TOLERANCE: f64 = 1e-6;

/// A named leaf identity.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Taxon {
    /// Unique tip label.
    pub name: String,
    /// Species the sample belongs to (defaults to `name`).
    pub species: String,
    /// Sampling age; zero for extant samples.
    pub age: f64,
}

impl Taxon {
    /// An extant taxon.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            species: name.clone(),
            name,
            age: 0.0,
        }
    }

    /// A taxon sampled `age` time units before the present.
    pub fn with_age(name: impl Into<String>, age: f64) -> Self {
        let mut taxon = Self::new(name);
        taxon.age = age;
        taxon
    }
}

/// A set of taxa constrained to be monophyletic.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Clade {
    /// Optional display name.
    pub name: Option<String>,
    taxa: BTreeSet<String>,
    /// Optional calibration age of the clade's MRCA.
    pub age: Option<f64>,
    /// Number of taxa known to belong to the clade but absent from the tree.
    pub num_missing: usize,
}

impl Clade {
    /// Build a clade from taxon names.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two distinct taxa are given.
    pub fn new<I, S>(taxa: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let taxa: BTreeSet<String> = taxa.into_iter().map(Into::into).collect();
        if taxa.len() < 2 {
            return Err(PhyloError::InvalidInput(
                "a clade needs at least two distinct taxa".into(),
            ));
        }
        Ok(Self {
            name: None,
            taxa,
            age: None,
            num_missing: 0,
        })
    }

    /// Attach a display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Record taxa that belong to the clade but are absent from the tree.
    pub fn with_missing(mut self, num_missing: usize) -> Self {
        self.num_missing = num_missing;
        self
    }

    /// The taxa in the clade, sorted by name.
    pub fn taxa(&self) -> &BTreeSet<String> {
        &self.taxa
    }

    /// Number of taxa in the clade.
    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    /// Always false: clades hold at least two taxa.
    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    /// True if every taxon of `other` is also in `self`.
    pub fn is_superset(&self, other: &Clade) -> bool {
        self.taxa.is_superset(&other.taxa)
    }

    /// True if the two clades share no taxon.
    pub fn is_disjoint(&self, other: &Clade) -> bool {
        self.taxa.is_disjoint(&other.taxa)
    }
}

impl Eq for Clade {}

impl PartialOrd for Clade {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Clade {
    /// Smaller clades first, ties broken by the sorted taxon names.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.taxa
            .len()
            .cmp(&other.taxa.len())
            .then_with(|| self.taxa.cmp(&other.taxa))
    }
}

/// A single node in a time tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeNode {
    /// Index of this node in the arena.
    pub index: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes (empty for tips, two for bifurcations).
    pub children: Vec<NodeId>,
    /// Time before the present.
    pub age: f64,
    /// Taxon attached to a tip.
    pub taxon: Option<Taxon>,
    /// Tip that is a direct ancestor of its sibling lineage.
    pub sampled_ancestor: bool,
}

impl TreeNode {
    /// A tip carrying `taxon`, aged at the taxon's sampling age.
    pub fn tip(taxon: Taxon) -> Self {
        Self {
            index: 0,
            parent: None,
            children: Vec::new(),
            age: taxon.age,
            taxon: Some(taxon),
            sampled_ancestor: false,
        }
    }

    /// An internal node joining `children`.
    pub fn internal(children: Vec<NodeId>, age: f64) -> Self {
        Self {
            index: 0,
            parent: None,
            children,
            age,
            taxon: None,
            sampled_ancestor: false,
        }
    }

    /// True if this node has no children.
    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True for a tip sampled before the present.
    pub fn is_fossil(&self) -> bool {
        self.is_tip() && self.age > AGE_TOLERANCE
    }

    /// Tip label, if any.
    pub fn name(&self) -> Option<&str> {
        self.taxon.as_ref().map(|t| t.name.as_str())
    }
}

/// Observer notified whenever a node of a tree changes.
pub trait TreeChangeListener: fmt::Debug {
    /// Called with the node whose age or topology changed.
    fn fire_tree_change(&self, node: NodeId);
}

#[derive(Clone, Default)]
struct Listeners(Vec<Rc<dyn TreeChangeListener>>);

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listeners({})", self.0.len())
    }
}

/// A rooted, binary, time-calibrated tree stored as an arena of nodes.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
    num_tips: usize,
    #[cfg_attr(feature = "serde", serde(skip))]
    listeners: Listeners,
}

impl TimeTree {
    /// Create a tree from nodes already laid out in canonical order.
    ///
    /// # Errors
    ///
    /// Returns an error if indices do not match positions, tips do not come
    /// first, the root is not last, or parent/child links disagree.
    pub fn from_nodes(nodes: Vec<TreeNode>, root: NodeId) -> Result<Self> {
        if nodes.is_empty() {
            return Err(PhyloError::InvalidInput("empty node list".into()));
        }
        if root >= nodes.len() {
            return Err(PhyloError::InvalidInput(format!(
                "root index {} out of range ({})",
                root,
                nodes.len()
            )));
        }
        let num_tips = nodes.iter().filter(|n| n.is_tip()).count();
        for (i, node) in nodes.iter().enumerate() {
            if node.index != i {
                return Err(PhyloError::InvalidInput(format!(
                    "node at position {} carries index {}",
                    i, node.index
                )));
            }
            if node.is_tip() != (i < num_tips) {
                return Err(PhyloError::InvalidInput(format!(
                    "node {} breaks the tips-first index layout",
                    i
                )));
            }
            if !node.is_tip() && node.children.len() != 2 {
                return Err(PhyloError::InvalidInput(format!(
                    "internal node {} has {} children, expected 2",
                    i,
                    node.children.len()
                )));
            }
            for &c in &node.children {
                if c >= nodes.len() || nodes[c].parent != Some(i) {
                    return Err(PhyloError::InvalidInput(format!(
                        "child {} of node {} does not point back to its parent",
                        c, i
                    )));
                }
            }
            if node.is_root() != (i == root) {
                return Err(PhyloError::InvalidInput(format!(
                    "node {} disagrees with root index {}",
                    i, root
                )));
            }
        }
        if nodes.len() > 1 && root != nodes.len() - 1 {
            return Err(PhyloError::InvalidInput("the root must be the last node".into()));
        }
        Ok(Self {
            nodes,
            root,
            num_tips,
            listeners: Listeners::default(),
        })
    }

    /// Create a tree from nodes in any order, renumbering them canonically.
    ///
    /// Tips keep their preorder encounter order; internal nodes are numbered
    /// in postorder so the root comes last. `index` and `parent` fields of
    /// the input are ignored and rebuilt from `children`.
    pub fn from_unordered(mut nodes: Vec<TreeNode>, root: NodeId) -> Result<Self> {
        if root >= nodes.len() {
            return Err(PhyloError::InvalidInput(format!(
                "root index {} out of range ({})",
                root,
                nodes.len()
            )));
        }
        let mut preorder = Vec::with_capacity(nodes.len());
        let mut seen = vec![false; nodes.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen[id] {
                return Err(PhyloError::InvalidInput(format!(
                    "node {} is reachable twice",
                    id
                )));
            }
            seen[id] = true;
            preorder.push(id);
            for &c in nodes[id].children.iter().rev() {
                if c >= nodes.len() {
                    return Err(PhyloError::InvalidInput(format!(
                        "child index {} out of range",
                        c
                    )));
                }
                stack.push(c);
            }
        }
        if preorder.len() != nodes.len() {
            return Err(PhyloError::InvalidInput(
                "nodes unreachable from the root".into(),
            ));
        }

        let tips: Vec<NodeId> = preorder
            .iter()
            .copied()
            .filter(|&id| nodes[id].children.is_empty())
            .collect();
        // Reversed preorder puts every node after all of its descendants.
        let internal_postorder: Vec<NodeId> = preorder
            .iter()
            .rev()
            .copied()
            .filter(|&id| !nodes[id].children.is_empty())
            .collect();

        let mut new_index = vec![0; nodes.len()];
        for (i, &old) in tips.iter().chain(internal_postorder.iter()).enumerate() {
            new_index[old] = i;
        }
        let mut slots: Vec<Option<TreeNode>> = nodes.drain(..).map(Some).collect();
        let mut ordered = Vec::with_capacity(slots.len());
        for &old in tips.iter().chain(internal_postorder.iter()) {
            let mut node = slots[old]
                .take()
                .ok_or_else(|| PhyloError::InvalidInput("duplicate node".into()))?;
            node.index = new_index[old];
            node.children = node.children.iter().map(|&c| new_index[c]).collect();
            node.parent = None;
            ordered.push(node);
        }
        for i in 0..ordered.len() {
            let children = ordered[i].children.clone();
            for c in children {
                ordered[c].parent = Some(i);
            }
        }
        let root = new_index[root];
        Self::from_nodes(ordered, root)
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Access a node by id, panicking when out of range like slice indexing.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    /// All nodes in index order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Age of the root.
    pub fn root_age(&self) -> f64 {
        self.nodes[self.root].age
    }

    /// Number of tips, including sampled ancestors.
    pub fn num_tips(&self) -> usize {
        self.num_tips
    }

    /// Total number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Tip ids in index order.
    pub fn tips(&self) -> impl Iterator<Item = NodeId> + '_ {
        0..self.num_tips
    }

    /// Internal node ids (including the root) in index order.
    pub fn internal_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.num_tips..self.nodes.len()
    }

    /// Number of tips flagged as sampled ancestors.
    pub fn num_sampled_ancestors(&self) -> usize {
        self.nodes[..self.num_tips]
            .iter()
            .filter(|n| n.sampled_ancestor)
            .count()
    }

    /// Sorted tip labels (unlabelled tips are skipped).
    pub fn tip_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes[..self.num_tips]
            .iter()
            .filter_map(|n| n.name().map(str::to_owned))
            .collect();
        names.sort();
        names
    }

    /// Time between a node and its parent (zero for the root).
    pub fn branch_length(&self, id: NodeId) -> f64 {
        match self.nodes[id].parent {
            Some(p) => self.nodes[p].age - self.nodes[id].age,
            None => 0.0,
        }
    }

    /// True if the node is a bifurcation with a sampled-ancestor child.
    pub fn has_sampled_ancestor_child(&self, id: NodeId) -> bool {
        self.nodes[id]
            .children
            .iter()
            .any(|&c| self.nodes[c].sampled_ancestor)
    }

    /// Set the age of a node and notify listeners.
    ///
    /// Ordering against parent and children is not enforced here: invalid
    /// ages are legal tree states that evaluate to probability zero.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown node or a negative / non-finite age.
    pub fn set_age(&mut self, id: NodeId, age: f64) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(PhyloError::InvalidInput(format!(
                "node index {} out of range ({})",
                id,
                self.nodes.len()
            )));
        }
        if !age.is_finite() || age < 0.0 {
            return Err(PhyloError::InvalidInput(format!(
                "invalid age {} for node {}",
                age, id
            )));
        }
        self.nodes[id].age = age;
        if let Some(taxon) = self.nodes[id].taxon.as_mut() {
            taxon.age = age;
        }
        self.notify(id);
        Ok(())
    }

    /// Set the root age.
    pub fn set_root_age(&mut self, age: f64) -> Result<()> {
        self.set_age(self.root, age)
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> PostorderIter {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            result.push(id);
            for &child in &self.nodes[id].children {
                stack.push(child);
            }
        }
        result.reverse();
        PostorderIter {
            sequence: result,
            pos: 0,
        }
    }

    /// Tip labels below every node, computed in one postorder sweep.
    pub fn tip_sets(&self) -> Vec<BTreeSet<String>> {
        let mut sets = vec![BTreeSet::new(); self.nodes.len()];
        for id in self.iter_postorder() {
            let node = &self.nodes[id];
            if node.is_tip() {
                if let Some(name) = node.name() {
                    sets[id].insert(name.to_owned());
                }
            } else {
                let mut merged = BTreeSet::new();
                for &c in &node.children {
                    merged.extend(sets[c].iter().cloned());
                }
                sets[id] = merged;
            }
        }
        sets
    }

    /// Tip labels below a single node.
    pub fn taxa_below(&self, id: NodeId) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if node.is_tip() {
                if let Some(name) = node.name() {
                    out.insert(name.to_owned());
                }
            }
            stack.extend(node.children.iter().copied());
        }
        out
    }

    /// True if some node has exactly the clade's taxa below it.
    pub fn contains_clade(&self, clade: &Clade) -> bool {
        self.tip_sets().iter().any(|s| s == clade.taxa())
    }

    /// The node whose tip set equals the clade, if the clade is monophyletic.
    pub fn clade_node(&self, clade: &Clade) -> Option<NodeId> {
        self.tip_sets().iter().position(|s| s == clade.taxa())
    }

    /// Register an observer for node changes.
    pub fn add_listener(&mut self, listener: Rc<dyn TreeChangeListener>) {
        self.listeners.0.push(listener);
    }

    /// Registered observers.
    pub fn listeners(&self) -> &[Rc<dyn TreeChangeListener>] {
        &self.listeners.0
    }

    /// Move the observers of `other` onto this tree.
    pub fn take_listeners_from(&mut self, other: &mut TimeTree) {
        let moved = std::mem::take(&mut other.listeners.0);
        self.listeners.0.extend(moved);
    }

    /// Notify observers that `node` changed.
    pub fn notify(&self, node: NodeId) {
        for listener in &self.listeners.0 {
            listener.fire_tree_change(node);
        }
    }

    /// Parse a Newick string whose branch lengths are times.
    pub fn from_newick(input: &str) -> Result<Self> {
        crate::newick::parse(input)
    }

    /// Serialize the tree to a Newick string with branch lengths as times.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self)
    }

    /// A one-line description of the tree.
    pub fn summary(&self) -> String {
        format!(
            "TimeTree: {} tips ({} sampled ancestors), root age {}",
            self.num_tips,
            self.num_sampled_ancestors(),
            self.root_age()
        )
    }
}

impl PartialEq for TimeTree {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes && self.root == other.root
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a TimeTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Push children in reverse order so leftmost is visited first.
        for &child in self.tree.nodes[id].children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

/// Post-order iterator over node ids.
pub struct PostorderIter {
    sequence: Vec<NodeId>,
    pos: usize,
}

impl Iterator for PostorderIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}
