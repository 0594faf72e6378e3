//! The contract an internal object type implements
//!
//! One [`InternalPhase`] handles every phase of one internal type; the
//! engine dispatches on [`ElementId::phase`]. Implementations are pure
//! functions of their arguments: all persistence, locking and propagation
//! is done by the engine.

use converge_core::{CurrentState, ElementId, ObjectId};
use serde_json::Value;
use std::collections::BTreeMap;

/// Verdict on a new external spec
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    /// Use `spec` as the target; `links` are the elements whose committed
    /// outputs `Process` will consume
    Accept {
        /// Normalized spec stored in the target state
        spec: Value,
        /// Declared dependencies
        links: Vec<ElementId>,
    },
    /// Not yet; the external object is looked at again later
    Reject(String),
    /// Permanently invalid spec
    Invalid(String),
}

impl Acceptance {
    /// Accept `spec` without dependencies
    pub fn accept(spec: Value) -> Self {
        Acceptance::Accept {
            spec,
            links: Vec::new(),
        }
    }
}

/// Everything `Process` may look at
#[derive(Debug, Clone, Copy)]
pub struct ProcessRequest<'a> {
    /// Element being processed
    pub element: &'a ElementId,
    /// Accepted target spec (`Null` when the target was never set)
    pub spec: &'a Value,
    /// Committed state of every declared dependency
    pub inputs: &'a BTreeMap<ElementId, CurrentState>,
    /// Last committed state of this element
    pub current: &'a CurrentState,
    /// Formal version of spec and inputs
    pub formal_version: &'a str,
    /// The triggering external object is gone
    pub deleting: bool,
}

impl<'a> ProcessRequest<'a> {
    /// Committed output of a dependency
    pub fn input(&self, id: &ElementId) -> Option<&'a Value> {
        self.inputs.get(id).and_then(|c| c.output.as_ref())
    }
}

/// External objects to create, update or delete on behalf of an element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaveChanges {
    /// Objects to create or update, with their spec
    pub apply: Vec<(ObjectId, Value)>,
    /// Objects to delete
    pub delete: Vec<ObjectId>,
}

impl SlaveChanges {
    /// No changes
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.delete.is_empty()
    }
}

/// Outcome of one `Process` call
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Commit `output`, then apply `slaves`
    Completed {
        /// Produced output
        output: Value,
        /// Owned objects to reconcile
        slaves: SlaveChanges,
    },
    /// Inputs not available yet; keep the lock and retry
    Waiting(String),
    /// Roll back with the given message
    Failed(String),
    /// The element is gone
    Deleted,
}

impl ProcessResult {
    /// Completed without slave changes
    pub fn completed(output: Value) -> Self {
        ProcessResult::Completed {
            output,
            slaves: SlaveChanges::default(),
        }
    }
}

/// Capability set of one internal object type
pub trait InternalPhase: Send + Sync {
    /// Validate an external spec for `element` and declare its dependencies
    fn accept_external_state(&self, element: &ElementId, spec: &Value) -> Acceptance;

    /// Compute the output of `request.element`
    fn process(&self, request: &ProcessRequest<'_>) -> ProcessResult;

    /// Called after an output was committed
    fn commit(&self, _element: &ElementId, _output: &Value) {}

    /// Called after a target was rolled back
    fn rollback(&self, _element: &ElementId, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_input_lookup() {
        let a = ObjectId::new("V", "ns", "a").element("calc");
        let b = ObjectId::new("V", "ns", "b").element("calc");
        let mut inputs = BTreeMap::new();
        inputs.insert(
            a.clone(),
            CurrentState {
                output: Some(json!(5)),
                ..Default::default()
            },
        );
        inputs.insert(b.clone(), CurrentState::default());
        let current = CurrentState::default();
        let element = ObjectId::new("O", "ns", "x").element("calc");
        let req = ProcessRequest {
            element: &element,
            spec: &Value::Null,
            inputs: &inputs,
            current: &current,
            formal_version: "",
            deleting: false,
        };
        assert_eq!(req.input(&a), Some(&json!(5)));
        assert_eq!(req.input(&b), None);
    }

    #[test]
    fn test_constructors() {
        assert_eq!(
            Acceptance::accept(json!(1)),
            Acceptance::Accept {
                spec: json!(1),
                links: vec![]
            }
        );
        assert!(matches!(
            ProcessResult::completed(json!(2)),
            ProcessResult::Completed { slaves, .. } if slaves.is_empty()
        ));
    }
}
