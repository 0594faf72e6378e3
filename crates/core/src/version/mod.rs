//! Formal versions
//!
//! A formal version is a reproducible string describing a node together
//! with the versions of everything it transitively depends on. Two elements
//! with equal formal versions were computed from identical inputs.
//!
//! Text forms:
//!
//! ```text
//! formal version:  type/name[version](child1,child2,...)
//! full string:     graph ":" versionlist
//!   graph       := effname ["(" graph ("," graph)* ")"]
//!   versionlist := effname "[" version "]" ("," effname "[" version "]")*
//!   effname     := type "/" name
//!   name        := segment ("/" segment)*
//! ```
//!
//! Children are always listed in sorted order.

mod graph;
mod parse;

pub use graph::{Composer, Graph, HashedComposer, TextComposer};
pub use parse::parse;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Characters with a syntactic meaning in the text forms
pub const SPECIAL_CHARS: &[char] = &['/', '(', ')', ',', '[', ']', ':'];

/// Identity of a graph node: `type/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Type segment
    pub type_name: String,
    /// Name, one or more `/`-separated segments
    pub name: String,
}

impl NodeId {
    /// Create a node id
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Check that the id can be written in the text forms
    pub fn validate(&self) -> Result<()> {
        if !is_segment(&self.type_name) || !self.name.split('/').all(is_segment) {
            return Err(Error::InvalidOperation(format!(
                "node id '{}' contains special characters or empty segments",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.name)
    }
}

/// A node with its own version tag and its dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identity
    pub id: NodeId,
    /// Own version, e.g. a content hash of the node's spec
    pub version: String,
    /// Dependencies, kept sorted and unique
    pub deps: Vec<NodeId>,
}

impl Node {
    /// Create a node
    pub fn new(id: NodeId, version: impl Into<String>, deps: Vec<NodeId>) -> Self {
        let mut node = Self {
            id,
            version: version.into(),
            deps,
        };
        node.normalize();
        node
    }

    pub(crate) fn normalize(&mut self) {
        self.deps.sort();
        self.deps.dedup();
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains(SPECIAL_CHARS)
}

/// Lowercase hex SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Deterministic object name derived from a formal version
///
/// Objects generated by a phase are named from the formal version of the
/// generating element, so regenerating from the same inputs yields the
/// same names and different inputs never collide.
pub fn generated_name(prefix: &str, formal_version: &str) -> String {
    let hash = sha256_hex(formal_version.as_bytes());
    format!("{}-{}", prefix, &hash[..12])
}
