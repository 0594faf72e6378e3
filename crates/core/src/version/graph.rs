//! Formal version graph
//!
//! Nodes live in a flat map keyed by [`NodeId`]; dependencies are ids into
//! that map. Construction rejects cycles, so every walk afterwards can rely
//! on termination.

use super::{sha256_hex, Node, NodeId};
use crate::dag::check_acyclic;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Combines a node with the formal versions of its dependencies
pub trait Composer: Send + Sync {
    /// Formal version of `node` given its children's formal versions
    fn compose(&self, node: &Node, children: &[String]) -> String;
}

/// `type/name[version](child1,child2,...)`, children sorted
#[derive(Debug, Clone, Copy, Default)]
pub struct TextComposer;

impl Composer for TextComposer {
    fn compose(&self, node: &Node, children: &[String]) -> String {
        let mut out = format!("{}[{}]", node.id, node.version);
        if !children.is_empty() {
            let mut sorted: Vec<&str> = children.iter().map(|c| c.as_str()).collect();
            sorted.sort_unstable();
            out.push('(');
            out.push_str(&sorted.join(","));
            out.push(')');
        }
        out
    }
}

/// SHA-256 hex digest of the textual form
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedComposer;

impl Composer for HashedComposer {
    fn compose(&self, node: &Node, children: &[String]) -> String {
        sha256_hex(TextComposer.compose(node, children).as_bytes())
    }
}

/// Acyclic graph of versioned nodes
#[derive(Debug, Clone)]
pub struct Graph<C = TextComposer> {
    composer: C,
    nodes: BTreeMap<NodeId, Node>,
}

impl<C: Composer> Graph<C> {
    /// Build a graph from explicit nodes
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for duplicate nodes, ids with special characters,
    ///   or versions containing `]`
    /// - `UnknownNode` if a dependency names a node that was not given
    /// - `DependencyCycle` if a node transitively depends on itself
    pub fn new<I>(composer: C, nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = Node>,
    {
        let mut map = BTreeMap::new();
        for mut node in nodes {
            node.id.validate()?;
            if node.version.contains(']') {
                return Err(Error::InvalidOperation(format!(
                    "version of node {} contains ']'",
                    node.id
                )));
            }
            node.normalize();
            if map.contains_key(&node.id) {
                return Err(Error::InvalidOperation(format!(
                    "node {} given twice",
                    node.id
                )));
            }
            map.insert(node.id.clone(), node);
        }
        for node in map.values() {
            if let Some(missing) = node.deps.iter().find(|d| !map.contains_key(*d)) {
                return Err(Error::UnknownNode(missing.to_string()));
            }
        }
        let edges: BTreeMap<NodeId, Vec<NodeId>> = map
            .iter()
            .map(|(id, n)| (id.clone(), n.deps.clone()))
            .collect();
        check_acyclic(&edges)?;
        Ok(Self {
            composer,
            nodes: map,
        })
    }

    /// Look up a node
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, sorted by id
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Formal version of one node
    pub fn formal_version(&self, id: &NodeId) -> Result<String> {
        let mut memo = HashMap::new();
        self.compose_into(id, &mut memo)
    }

    /// Formal versions of all nodes, sharing one memo table
    pub fn formal_versions(&self) -> Result<HashMap<NodeId, String>> {
        let mut memo = HashMap::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            self.compose_into(id, &mut memo)?;
        }
        Ok(memo)
    }

    fn compose_into(&self, root: &NodeId, memo: &mut HashMap<NodeId, String>) -> Result<String> {
        if let Some(v) = memo.get(root) {
            return Ok(v.clone());
        }
        let root_node = self
            .nodes
            .get(root)
            .ok_or_else(|| Error::UnknownNode(root.to_string()))?;

        // Post-order: a node is composed once all its children are memoized.
        let mut stack: Vec<(&Node, bool)> = vec![(root_node, false)];
        while let Some((node, expanded)) = stack.pop() {
            if memo.contains_key(&node.id) {
                continue;
            }
            if !expanded {
                stack.push((node, true));
                for dep in &node.deps {
                    if !memo.contains_key(dep) {
                        if let Some(child) = self.nodes.get(dep) {
                            stack.push((child, false));
                        }
                    }
                }
                continue;
            }
            let children: Vec<String> = node
                .deps
                .iter()
                .filter_map(|d| memo.get(d).cloned())
                .collect();
            let version = self.composer.compose(node, &children);
            memo.insert(node.id.clone(), version);
        }
        memo.get(root)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(root.to_string()))
    }

    /// Ids reachable from `root`, including `root`
    pub fn reachable(&self, root: &NodeId) -> Result<BTreeSet<NodeId>> {
        if !self.nodes.contains_key(root) {
            return Err(Error::UnknownNode(root.to_string()));
        }
        let mut seen = BTreeSet::new();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                pending.extend(node.deps.iter());
            }
        }
        Ok(seen)
    }

    /// Nodes reachable from `root`
    pub fn subgraph(&self, root: &NodeId) -> Result<BTreeMap<NodeId, Node>> {
        Ok(self
            .reachable(root)?
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|n| (id, n.clone())))
            .collect())
    }

    /// `graph ":" versionlist` form of the subgraph rooted at `root`
    ///
    /// [`parse`](super::parse) is the exact inverse.
    pub fn full_string(&self, root: &NodeId) -> Result<String> {
        enum Step<'a> {
            Node(&'a NodeId),
            Lit(&'static str),
        }

        let reachable = self.reachable(root)?;
        let mut out = String::new();
        let mut stack = vec![Step::Node(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Lit(s) => out.push_str(s),
                Step::Node(id) => {
                    out.push_str(&id.to_string());
                    let deps = match self.nodes.get(id) {
                        Some(n) => &n.deps,
                        None => continue,
                    };
                    if deps.is_empty() {
                        continue;
                    }
                    out.push('(');
                    stack.push(Step::Lit(")"));
                    for (i, dep) in deps.iter().enumerate().rev() {
                        stack.push(Step::Node(dep));
                        if i > 0 {
                            stack.push(Step::Lit(","));
                        }
                    }
                }
            }
        }

        out.push(':');
        let versions: Vec<String> = reachable
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| format!("{}[{}]", n.id, n.version))
            .collect();
        out.push_str(&versions.join(","));
        Ok(out)
    }
}
