//! Parser for the `graph ":" versionlist` text form
//!
//! The graph portion fixes the structure; versions are attached onto the
//! already-built nodes in a second pass.

use super::{Node, NodeId, SPECIAL_CHARS};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Result of parsing a full formal version string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedGraph {
    /// Outermost node of the graph portion
    pub root: NodeId,
    /// All nodes, with versions attached
    pub nodes: BTreeMap<NodeId, Node>,
}

impl ParsedGraph {
    /// The root node
    pub fn root_node(&self) -> Option<&Node> {
        self.nodes.get(&self.root)
    }

    /// Build a [`Graph`](super::Graph) from the parsed nodes
    pub fn into_graph<C: super::Composer>(self, composer: C) -> Result<super::Graph<C>> {
        super::Graph::new(composer, self.nodes.into_values())
    }
}

/// Parse a full formal version string
///
/// # Errors
///
/// - `Syntax` with the offending character and its offset on malformed input
/// - `UnknownNode` if a versioned entry names a node absent from the graph
///   portion
/// - `InvalidOperation` if a node occurs with inconsistent dependencies or
///   has no version entry
pub fn parse(input: &str) -> Result<ParsedGraph> {
    let mut p = Parser {
        input,
        pos: 0,
        nodes: BTreeMap::new(),
    };
    let root = p.graph()?;
    p.expect(':')?;
    p.version_list()?;
    if p.pos != input.len() {
        return Err(Error::syntax(input, p.pos, "',' or end of input"));
    }
    if let Some(n) = p.nodes.values().find(|n| n.version.is_none()) {
        return Err(Error::InvalidOperation(format!("node {} has no version", n.id)));
    }
    let nodes = p
        .nodes
        .into_iter()
        .map(|(id, n)| {
            let node = Node {
                id: id.clone(),
                version: n.version.unwrap_or_default(),
                deps: n.deps,
            };
            (id, node)
        })
        .collect();
    Ok(ParsedGraph { root, nodes })
}

struct Partial {
    id: NodeId,
    version: Option<String>,
    deps: Vec<NodeId>,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    nodes: BTreeMap<NodeId, Partial>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(Error::syntax(self.input, self.pos, format!("'{}'", c)))
        }
    }

    fn segment(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let rest = &self.input[start..];
        let len = rest.find(SPECIAL_CHARS).unwrap_or(rest.len());
        if len == 0 {
            return Err(Error::syntax(self.input, start, "name segment"));
        }
        self.pos += len;
        Ok(&self.input[start..start + len])
    }

    fn effname(&mut self) -> Result<NodeId> {
        let type_name = self.segment()?;
        self.expect('/')?;
        let mut name = self.segment()?.to_string();
        while self.peek() == Some('/') {
            self.pos += 1;
            name.push('/');
            name.push_str(self.segment()?);
        }
        Ok(NodeId::new(type_name, name))
    }

    fn graph(&mut self) -> Result<NodeId> {
        let id = self.effname()?;
        let mut deps = Vec::new();
        if self.peek() == Some('(') {
            self.pos += 1;
            loop {
                deps.push(self.graph()?);
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(Error::syntax(self.input, self.pos, "',' or ')'")),
                }
            }
        }
        deps.sort();
        deps.dedup();

        match self.nodes.get(&id) {
            Some(existing) if existing.deps != deps => {
                return Err(Error::InvalidOperation(format!(
                    "node {} occurs with different dependencies",
                    id
                )));
            }
            Some(_) => {}
            None => {
                self.nodes.insert(
                    id.clone(),
                    Partial {
                        id: id.clone(),
                        version: None,
                        deps,
                    },
                );
            }
        }
        Ok(id)
    }

    fn version_list(&mut self) -> Result<()> {
        loop {
            let id = self.effname()?;
            self.expect('[')?;
            let start = self.pos;
            let len = self.input[start..]
                .find(']')
                .ok_or_else(|| Error::syntax(self.input, self.input.len(), "']'"))?;
            let version = &self.input[start..start + len];
            self.pos += len + 1;

            let node = self
                .nodes
                .get_mut(&id)
                .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
            node.version = Some(version.to_string());

            if self.peek() == Some(',') {
                self.pos += 1;
            } else {
                return Ok(());
            }
        }
    }
}
