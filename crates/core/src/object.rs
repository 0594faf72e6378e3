//! Persisted object data model
//!
//! Every object in the store is a [`StoredObject`]: its id, the store
//! version of its last write, and one of three payloads:
//!
//! - `Namespace`: holds the single persisted RunLock of a namespace
//! - `External`: a user-authored spec plus the status written back by the engine
//! - `Internal`: per-phase reconciliation state for one internal object
//!
//! The `PhaseState` transforms below are pure: they only describe how one
//! optimistic write changes the state and report whether anything changed.
//! They are applied inside the store's compare-and-set loop and may run
//! more than once.

use crate::status::Status;
use crate::types::{ElementId, ObjectId, RunId};
use crate::version::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An object as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Object identity
    pub id: ObjectId,
    /// Store version of the last write (0 = never written)
    pub version: u64,
    /// Payload
    pub data: ObjectData,
}

impl StoredObject {
    /// New, not yet persisted object
    pub fn new(id: ObjectId, data: ObjectData) -> Self {
        Self {
            id,
            version: 0,
            data,
        }
    }

    /// Namespace payload, if this is a namespace object
    pub fn as_namespace(&self) -> Option<&NamespaceState> {
        match &self.data {
            ObjectData::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    /// Mutable namespace payload
    pub fn as_namespace_mut(&mut self) -> Option<&mut NamespaceState> {
        match &mut self.data {
            ObjectData::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    /// External payload, if this is an external object
    pub fn as_external(&self) -> Option<&ExternalState> {
        match &self.data {
            ObjectData::External(ext) => Some(ext),
            _ => None,
        }
    }

    /// Mutable external payload
    pub fn as_external_mut(&mut self) -> Option<&mut ExternalState> {
        match &mut self.data {
            ObjectData::External(ext) => Some(ext),
            _ => None,
        }
    }

    /// Internal payload, if this is an internal object
    pub fn as_internal(&self) -> Option<&InternalState> {
        match &self.data {
            ObjectData::Internal(int) => Some(int),
            _ => None,
        }
    }

    /// Mutable internal payload
    pub fn as_internal_mut(&mut self) -> Option<&mut InternalState> {
        match &mut self.data {
            ObjectData::Internal(int) => Some(int),
            _ => None,
        }
    }
}

/// Object payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectData {
    /// Namespace object
    Namespace(NamespaceState),
    /// User-authored object
    External(ExternalState),
    /// Engine-owned per-phase state
    Internal(InternalState),
}

impl ObjectData {
    /// Mutable external payload
    pub fn as_external_mut(&mut self) -> Option<&mut ExternalState> {
        match self {
            ObjectData::External(e) => Some(e),
            _ => None,
        }
    }

    /// Mutable internal payload
    pub fn as_internal_mut(&mut self) -> Option<&mut InternalState> {
        match self {
            ObjectData::Internal(i) => Some(i),
            _ => None,
        }
    }
}

// ============================================================================
// Namespace
// ============================================================================

/// Persisted namespace lock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceState {
    /// Run currently acquiring locks in this namespace
    pub run_lock: Option<RunId>,
}

impl NamespaceState {
    /// Set the lock if it is free
    pub fn try_lock(&mut self, run: RunId) -> bool {
        if self.run_lock.is_some() {
            return false;
        }
        self.run_lock = Some(run);
        true
    }

    /// Clear the lock if it is held by `run`
    pub fn unlock(&mut self, run: RunId) -> bool {
        if self.run_lock != Some(run) {
            return false;
        }
        self.run_lock = None;
        true
    }
}

// ============================================================================
// External objects
// ============================================================================

/// A user-authored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalState {
    /// User spec
    pub spec: Value,
    /// Status written back by the engine
    #[serde(default)]
    pub status: ExternalStatus,
}

impl ExternalState {
    /// New external state with an initial status
    pub fn new(spec: Value) -> Self {
        Self {
            spec,
            status: ExternalStatus::default(),
        }
    }

    /// Content hash of the spec
    ///
    /// Status write-backs change the object version but never the spec
    /// version, so comparing this against an element's observed version
    /// detects genuine spec drift only.
    pub fn spec_version(&self) -> String {
        content_version(&self.spec)
    }
}

/// Status fields of an external object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalStatus {
    /// Reconciliation status of the triggered element
    pub status: Status,
    /// Failure or progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last committed output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Spec version the status refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_version: Option<String>,
    /// Formal version of the committed element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formal_version: Option<String>,
    /// Spec version noticed on the latest re-check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_version: Option<String>,
    /// Run that produced this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

// ============================================================================
// Internal objects
// ============================================================================

/// Engine-owned state of one internal object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalState {
    /// Phase name → phase state
    pub phases: BTreeMap<String, PhaseState>,
    /// The triggering external object is gone
    #[serde(default)]
    pub deleting: bool,
}

impl InternalState {
    /// Internal state with one fresh phase state per phase name
    pub fn with_phases<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phases: phases
                .into_iter()
                .map(|p| (p.into(), PhaseState::default()))
                .collect(),
            deleting: false,
        }
    }

    /// State of one phase
    pub fn phase(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    /// Mutable state of one phase
    pub fn phase_mut(&mut self, phase: &str) -> Option<&mut PhaseState> {
        self.phases.get_mut(phase)
    }
}

/// Last committed state of an element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    /// Last external spec version noticed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_version: Option<String>,
    /// Spec version the output was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_version: Option<String>,
    /// Formal version of the inputs the output was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_version: Option<String>,
    /// Content version of the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_version: Option<String>,
    /// Committed output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Accepted spec the output was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    /// Dependencies the output was computed from
    #[serde(default)]
    pub links: Vec<ElementId>,
}

/// State being computed by the Run holding the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Spec version of the accepted external state
    pub object_version: String,
    /// Accepted spec
    pub spec: Value,
    /// Declared dependencies
    #[serde(default)]
    pub links: Vec<ElementId>,
}

/// Result of one successful `Process` call, ready to commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    /// Formal version of the inputs
    pub input_version: String,
    /// Produced output
    pub output: Value,
}

/// Status and message of a phase just before it was locked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorStatus {
    /// Status before locking
    pub status: Status,
    /// Message before locking
    pub message: Option<String>,
}

/// Persisted per-phase state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    /// Lock holder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Element status
    #[serde(default)]
    pub status: Status,
    /// Failure or progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last committed state
    #[serde(default)]
    pub current: CurrentState,
    /// Present only while locked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetState>,
}

impl PhaseState {
    /// Element holds an individual lock
    pub fn is_locked(&self) -> bool {
        self.run_id.is_some()
    }

    /// Element is locked by `run`
    pub fn is_locked_by(&self, run: RunId) -> bool {
        self.run_id == Some(run)
    }

    /// Status and message as they are now, for [`release`](Self::release)
    pub fn prior(&self) -> PriorStatus {
        PriorStatus {
            status: self.status,
            message: self.message.clone(),
        }
    }

    /// Acquire the individual lock for `run`
    pub fn try_lock(&mut self, run: RunId) -> bool {
        if self.run_id.is_some() {
            return false;
        }
        self.run_id = Some(run);
        self.status = Status::Pending;
        self.message = None;
        true
    }

    /// Release a lock held by `run` without touching the committed state
    ///
    /// Used to undo lock acquisition of an aborted locking attempt; the
    /// element never saw a target from this run.
    pub fn release(&mut self, run: RunId, previous: PriorStatus) -> bool {
        if self.run_id != Some(run) {
            return false;
        }
        self.run_id = None;
        self.target = None;
        self.status = previous.status;
        self.message = previous.message;
        true
    }

    /// Record the accepted target state
    pub fn set_target(&mut self, run: RunId, target: TargetState) -> bool {
        if self.run_id != Some(run) || self.target.as_ref() == Some(&target) {
            return false;
        }
        self.current.observed_version = Some(target.object_version.clone());
        self.target = Some(target);
        true
    }

    /// Set a transient status while locked
    pub fn set_status(&mut self, run: RunId, status: Status, message: Option<String>) -> bool {
        if self.run_id != Some(run) || (self.status == status && self.message == message) {
            return false;
        }
        self.status = status;
        self.message = message;
        true
    }

    /// Persist the target as current and clear the lock
    pub fn commit(&mut self, run: RunId, info: CommitInfo) -> bool {
        if self.run_id != Some(run) {
            return false;
        }
        let target = match self.target.take() {
            Some(t) => t,
            None => return false,
        };
        self.current.output_version = Some(content_version(&info.output));
        self.current.output = Some(info.output);
        self.current.input_version = Some(info.input_version);
        self.current.observed_version = Some(target.object_version.clone());
        self.current.object_version = Some(target.object_version);
        self.current.spec = Some(target.spec);
        self.current.links = target.links;
        self.status = Status::Completed;
        self.message = None;
        self.run_id = None;
        true
    }

    /// Discard the target and clear the lock
    ///
    /// With `keep_links`, the target links replace the current links so the
    /// element is re-queued when a dependency later commits. With
    /// `observed`, the spec version is remembered so an unchanged re-trigger
    /// is a no-op.
    pub fn rollback(
        &mut self,
        run: RunId,
        status: Status,
        message: Option<String>,
        keep_links: bool,
        observed: Option<String>,
    ) -> bool {
        if self.run_id != Some(run) {
            return false;
        }
        if let Some(target) = self.target.take() {
            if keep_links {
                self.current.links = target.links;
            }
        }
        if observed.is_some() {
            self.current.observed_version = observed;
        }
        self.status = status;
        self.message = message;
        self.run_id = None;
        true
    }

    /// Links of both the committed and the target state
    pub fn all_links(&self) -> impl Iterator<Item = &ElementId> {
        self.current
            .links
            .iter()
            .chain(self.target.iter().flat_map(|t| t.links.iter()))
    }
}

/// Content version of a JSON value
///
/// `serde_json` maps keep their keys sorted, so the serialized form is
/// canonical.
pub fn content_version(value: &Value) -> String {
    let text = serde_json::to_string(value).unwrap_or_default();
    sha256_hex(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(version: &str) -> TargetState {
        TargetState {
            object_version: version.to_string(),
            spec: json!({"value": 5}),
            links: vec![ObjectId::new("T", "ns", "dep").element("p")],
        }
    }

    #[test]
    fn test_namespace_lock_is_exclusive() {
        let mut ns = NamespaceState::default();
        let r1 = RunId::new();
        let r2 = RunId::new();
        assert!(ns.try_lock(r1));
        assert!(!ns.try_lock(r2));
        assert!(!ns.unlock(r2));
        assert!(ns.unlock(r1));
        assert!(ns.run_lock.is_none());
    }

    #[test]
    fn test_spec_version_ignores_status() {
        let mut ext = ExternalState::new(json!({"b": 1, "a": 2}));
        let before = ext.spec_version();
        ext.status.status = Status::Completed;
        ext.status.result = Some(json!(3));
        assert_eq!(before, ext.spec_version());
    }

    #[test]
    fn test_spec_version_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(content_version(&a), content_version(&b));
        assert_ne!(content_version(&a), content_version(&json!({"x": 2})));
    }

    #[test]
    fn test_phase_lock_and_commit() {
        let run = RunId::new();
        let mut ps = PhaseState::default();
        assert!(ps.try_lock(run));
        assert!(!ps.try_lock(RunId::new()));
        assert_eq!(ps.status, Status::Pending);

        assert!(ps.set_target(run, target("v1")));
        assert!(ps.commit(
            run,
            CommitInfo {
                input_version: "iv".into(),
                output: json!(5),
            }
        ));
        assert!(!ps.is_locked());
        assert!(ps.target.is_none());
        assert_eq!(ps.status, Status::Completed);
        assert_eq!(ps.current.output, Some(json!(5)));
        assert_eq!(ps.current.object_version.as_deref(), Some("v1"));
        assert_eq!(ps.current.links.len(), 1);
    }

    #[test]
    fn test_commit_requires_lock_holder_and_target() {
        let run = RunId::new();
        let mut ps = PhaseState::default();
        let info = CommitInfo {
            input_version: "iv".into(),
            output: json!(1),
        };
        assert!(!ps.commit(run, info.clone()));
        ps.try_lock(run);
        assert!(!ps.commit(run, info.clone()));
        ps.set_target(run, target("v1"));
        assert!(!ps.commit(RunId::new(), info));
    }

    #[test]
    fn test_set_target_requires_lock() {
        let mut ps = PhaseState::default();
        assert!(!ps.set_target(RunId::new(), target("v1")));
        assert!(ps.target.is_none());
    }

    #[test]
    fn test_rollback_keeps_links_and_observed() {
        let run = RunId::new();
        let mut ps = PhaseState::default();
        ps.try_lock(run);
        ps.set_target(run, target("v2"));
        assert!(ps.rollback(
            run,
            Status::Blocked,
            Some("missing".into()),
            true,
            Some("v2".into())
        ));
        assert!(!ps.is_locked());
        assert!(ps.target.is_none());
        assert_eq!(ps.status, Status::Blocked);
        assert_eq!(ps.current.links.len(), 1);
        assert_eq!(ps.current.observed_version.as_deref(), Some("v2"));
        assert!(ps.current.output.is_none());
    }

    #[test]
    fn test_release_restores_status_and_message() {
        let run = RunId::new();
        let mut ps = PhaseState {
            status: Status::Blocked,
            message: Some("dependency a missing".into()),
            ..Default::default()
        };
        let prior = ps.prior();
        assert!(ps.try_lock(run));
        assert_eq!(ps.status, Status::Pending);
        assert!(ps.message.is_none());

        assert!(ps.release(run, prior.clone()));
        assert_eq!(ps.status, Status::Blocked);
        assert_eq!(ps.message.as_deref(), Some("dependency a missing"));
        assert!(!ps.is_locked());
        assert!(!ps.release(run, prior));
    }

    #[test]
    fn test_all_links_covers_current_and_target() {
        let run = RunId::new();
        let mut ps = PhaseState::default();
        ps.current.links = vec![ObjectId::new("T", "ns", "old").element("p")];
        ps.try_lock(run);
        ps.set_target(run, target("v1"));
        let names: Vec<_> = ps.all_links().map(|l| l.object.name.clone()).collect();
        assert_eq!(names, vec!["old".to_string(), "dep".to_string()]);
    }
}
