//! Newick reader and writer for time trees.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! Branch lengths are read as times. Node ages are the distance from the
//! deepest tip, so the youngest tip sits at age zero. A tip on a zero-length
//! branch is read as a sampled ancestor.

use phylodyn_core::{PhyloError, Result};

use crate::tree::{NodeId, Taxon, TimeTree, TreeNode};

/// Zero-length branches below this are treated as exactly zero.
const ZERO_LENGTH: f64 = 1e-12;

struct RawNode {
    children: Vec<usize>,
    branch_length: Option<f64>,
    name: Option<String>,
}

/// Parse a Newick format string into a `TimeTree`.
pub fn parse(input: &str) -> Result<TimeTree> {
    let mut parser = Parser::new(input.as_bytes());
    let (raw, root) = parser.parse_tree()?;

    let mut depth = vec![0.0; raw.len()];
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        for &c in &raw[id].children {
            let len = raw[c].branch_length.ok_or_else(|| {
                PhyloError::Parse(format!(
                    "missing branch length below {}",
                    raw[id].name.as_deref().unwrap_or("an internal node")
                ))
            })?;
            if len < 0.0 {
                return Err(PhyloError::Parse(format!("negative branch length {}", len)));
            }
            depth[c] = depth[id] + len;
            stack.push(c);
        }
    }
    let max_depth = depth.iter().copied().fold(0.0, f64::max);

    let nodes = raw
        .iter()
        .enumerate()
        .map(|(id, r)| {
            let mut age = max_depth - depth[id];
            if age.abs() < ZERO_LENGTH {
                age = 0.0;
            }
            if r.children.is_empty() {
                let name = r.name.clone().unwrap_or_else(|| format!("t{}", id));
                let mut node = TreeNode::tip(Taxon::with_age(name, age));
                node.sampled_ancestor =
                    id != root && r.branch_length.map_or(false, |l| l <= ZERO_LENGTH);
                node
            } else {
                TreeNode::internal(r.children.clone(), age)
            }
        })
        .collect();
    TimeTree::from_unordered(nodes, root)
}

/// Serialize a `TimeTree` to a Newick format string.
pub fn write(tree: &TimeTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &TimeTree, id: NodeId, buf: &mut String) {
    let node = tree.node(id);
    if !node.children.is_empty() {
        buf.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, buf);
        }
        buf.push(')');
    }
    if let Some(name) = node.name() {
        buf.push_str(name);
    }
    if !node.is_root() {
        buf.push(':');
        // Use enough precision but strip trailing zeros
        let s = format!("{:.10}", tree.branch_length(id));
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        buf.push_str(if s.is_empty() { "0" } else { s });
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<(Vec<RawNode>, usize)> {
        self.skip_whitespace();
        let root = self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(PhyloError::Parse("expected ';' at end of Newick string".into()));
        }
        self.pos += 1;
        Ok((std::mem::take(&mut self.nodes), root))
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let id = self.alloc_node();

        if self.peek() == Some(b'(') {
            self.pos += 1;
            let first_child = self.parse_subtree()?;
            self.nodes[id].children.push(first_child);

            loop {
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                    let child = self.parse_subtree()?;
                    self.nodes[id].children.push(child);
                } else {
                    break;
                }
            }
            self.skip_whitespace();
            if self.peek() != Some(b')') {
                return Err(PhyloError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1;
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(PhyloError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str.parse().map_err(|_| {
                PhyloError::Parse(format!("invalid branch length: '{}'", len_str))
            })?;
            self.nodes[id].branch_length = Some(len);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                b':' | b',' | b')' | b'(' | b';' | b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') = self.peek() {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc_node(&mut self) -> usize {
        self.nodes.push(RawNode {
            children: Vec::new(),
            branch_length: None,
            name: None,
        });
        self.nodes.len() - 1
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}
