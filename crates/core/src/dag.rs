//! Cycle detection over id-keyed graphs
//!
//! Graphs are passed as a flat adjacency map (arena style); the walk keeps
//! an explicit stack instead of recursing, so arbitrarily deep graphs and
//! self-references are handled without pointer chasing.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Fail with [`Error::DependencyCycle`] if the graph has a cycle
///
/// Nodes are visited in key order. Edges to ids missing from the map are
/// ignored; callers validate references separately. The reported path
/// starts at the first node of the cycle and repeats it at the end, e.g.
/// `A->B->D->A`.
pub fn check_acyclic<K>(edges: &BTreeMap<K, Vec<K>>) -> Result<()>
where
    K: Ord + Hash + Clone + Display,
{
    let mut marks: HashMap<&K, Mark> = HashMap::with_capacity(edges.len());

    for root in edges.keys() {
        if marks.contains_key(root) {
            continue;
        }
        // (node, index of next child to visit)
        let mut stack: Vec<(&K, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::OnStack);

        while let Some(top) = stack.last_mut() {
            let (node, next) = (top.0, top.1);
            let children = edges.get(node).map(|c| c.as_slice()).unwrap_or(&[]);
            if next >= children.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            }
            top.1 += 1;

            let child = &children[next];
            let child = match edges.get_key_value(child) {
                Some((k, _)) => k,
                None => continue,
            };
            match marks.get(child) {
                Some(Mark::Done) => {}
                Some(Mark::OnStack) => {
                    let start = stack
                        .iter()
                        .position(|(n, _)| *n == child)
                        .unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(child.to_string());
                    return Err(Error::DependencyCycle { path });
                }
                None => {
                    marks.insert(child, Mark::OnStack);
                    stack.push((child, 0));
                }
            }
        }
    }
    Ok(())
}
