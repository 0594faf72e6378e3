//! Element state machine
//!
//! Work items land here from the pool. External changes start Runs;
//! locked elements are driven through target preparation, dependency
//! checks, `Process` and commit or rollback; finished elements re-queue
//! their dependents.

use crate::element::{version_node_name, Element, NamespaceView};
use crate::engine::{Counters, EngineInner, WorkKey};
use crate::phase::{Acceptance, InternalPhase, ProcessRequest, ProcessResult, SlaveChanges};
use converge_core::error::{Error, Result};
use converge_core::{
    CommitInfo, CurrentState, ElementId, ExternalState, ExternalStatus, Graph, HashedComposer,
    InternalState, Node, NodeId, ObjectData, ObjectId, RunId, Status, StoredObject, TargetState,
    TextComposer, TypeId,
};
use converge_storage::modify;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Why the inputs of an element are not ready
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InputProblem {
    /// Dependency held by a Run; it re-queues us on commit
    Locked(ElementId),
    /// Dependency missing or not completed
    Unusable(ElementId, String),
}

type Inputs = BTreeMap<ElementId, CurrentState>;

impl EngineInner {
    // ========================================================================
    // External objects
    // ========================================================================

    pub(crate) fn reconcile_external(&self, id: &ObjectId) -> Result<()> {
        let trigger = match self.model.triggered_by(&id.type_name) {
            Some(t) => t.clone(),
            None => return Ok(()),
        };
        let internal_id = id.with_type(trigger.type_name.clone());
        match self.store.get_object(id) {
            Ok(obj) => self.begin_update(id, &obj, &internal_id, &trigger),
            Err(e) if e.is_not_exist() => self.begin_delete(id, &internal_id),
            Err(e) => Err(e),
        }
    }

    fn begin_update(
        &self,
        id: &ObjectId,
        obj: &StoredObject,
        internal_id: &ObjectId,
        trigger: &TypeId,
    ) -> Result<()> {
        let ext = obj
            .as_external()
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not an external object", id)))?;
        let spec_version = ext.spec_version();
        let (internal, fresh) = self.ensure_internal(internal_id)?;
        let state = internal
            .as_internal()
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not internal", internal_id)))?;
        let element = internal_id.element(trigger.phase.clone());
        let phase = state
            .phase(&trigger.phase)
            .ok_or_else(|| Error::UnknownType(trigger.to_string()))?;

        if phase.is_locked() {
            trace!(target: "converge::engine", element = %element, "run in flight");
            self.retry_later(WorkKey::External(id.clone()));
            return Ok(());
        }
        if !fresh
            && phase.current.observed_version.as_deref() == Some(spec_version.as_str())
        {
            if ext.status.status != phase.status
                || ext.status.observed_version != phase.current.observed_version
            {
                self.publish(&element, None)?;
            }
            return Ok(());
        }

        let roots: Vec<ElementId> = if fresh {
            self.model
                .dependent_type_phases(&internal_id.type_name)
                .into_iter()
                .map(|t| internal_id.element(t.phase))
                .collect()
        } else {
            vec![element]
        };
        debug!(target: "converge::engine", external = %id, roots = roots.len(), fresh, "spec changed");
        self.start_run(&internal_id.namespace, &roots, WorkKey::External(id.clone()))
    }

    /// Get the internal object, creating it or its missing phases
    ///
    /// Also clears a pending deletion mark. The flag is `true` when the
    /// object was created, revived or given missing phases.
    fn ensure_internal(&self, id: &ObjectId) -> Result<(StoredObject, bool)> {
        let phases = self
            .model
            .phases(&id.type_name)
            .ok_or_else(|| Error::UnknownType(id.type_name.clone()))?;
        let mut obj = match self.store.get_object(id) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => {
                let fresh = StoredObject::new(
                    id.clone(),
                    ObjectData::Internal(InternalState::with_phases(phases.iter().cloned())),
                );
                match self.store.create_object(fresh) {
                    Ok(obj) => {
                        info!(target: "converge::engine", object = %id, "internal object created");
                        return Ok((obj, true));
                    }
                    Err(e) if e.is_retryable() => self.store.get_object(id)?,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        let revived = modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
            match data.as_internal_mut() {
                Some(state) => {
                    let mut revived = std::mem::replace(&mut state.deleting, false);
                    for p in phases {
                        if !state.phases.contains_key(p) {
                            state.phases.insert(p.clone(), Default::default());
                            revived = true;
                        }
                    }
                    (revived, revived)
                }
                None => (false, false),
            }
        })?;
        if revived {
            info!(target: "converge::engine", object = %id, "internal object revived");
        }
        Ok((obj, revived))
    }

    fn begin_delete(&self, id: &ObjectId, internal_id: &ObjectId) -> Result<()> {
        // Another external type may still drive the same internal object.
        for t in self.model.triggering_types_for(&internal_id.type_name) {
            let other = internal_id.with_type(t);
            if other != *id && self.exists(&other)? {
                return Ok(());
            }
        }
        let mut obj = match self.store.get_object(internal_id) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => return Ok(()),
            Err(e) => return Err(e),
        };
        modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
            match data.as_internal_mut() {
                Some(state) if !state.deleting => {
                    state.deleting = true;
                    ((), true)
                }
                _ => ((), false),
            }
        })?;
        let state = match obj.as_internal() {
            Some(state) => state,
            None => return Ok(()),
        };
        if state.phases.is_empty() {
            self.remove_object(internal_id)?;
            self.notify(Some(Status::Deleted), internal_id);
            return Ok(());
        }
        if state.phases.values().any(|ps| ps.is_locked()) {
            self.retry_later(WorkKey::External(id.clone()));
            return Ok(());
        }
        info!(target: "converge::engine", object = %internal_id, "deleting");
        let roots: Vec<ElementId> = state
            .phases
            .keys()
            .map(|p| internal_id.element(p.clone()))
            .collect();
        self.start_run(&internal_id.namespace, &roots, WorkKey::External(id.clone()))
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        match self.store.get_object(id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove_object(&self, id: &ObjectId) -> Result<()> {
        match self.store.delete_object(id) {
            Ok(()) => {
                info!(target: "converge::engine", object = %id, "internal object removed");
                Ok(())
            }
            Err(e) if e.is_not_exist() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// First existing external object driving `internal`
    fn triggering_external(&self, internal: &ObjectId) -> Result<Option<StoredObject>> {
        for t in self.model.triggering_types_for(&internal.type_name) {
            match self.store.get_object(&internal.with_type(t)) {
                Ok(obj) => return Ok(Some(obj)),
                Err(e) if e.is_not_exist() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn start_run(&self, namespace: &str, roots: &[ElementId], retry: WorkKey) -> Result<()> {
        match self.lock_graph(namespace, roots)? {
            Some(run) => {
                debug!(target: "converge::engine", run = %run.id, elements = run.elements.len(), "run queued");
                for element in run.elements {
                    self.queue.enqueue(WorkKey::Element(element));
                }
            }
            None => self.retry_later(retry),
        }
        Ok(())
    }

    // ========================================================================
    // Elements
    // ========================================================================

    pub(crate) fn reconcile_element(&self, id: &ElementId) -> Result<()> {
        let element = match Element::load(self.store.as_ref(), id)? {
            Some(element) => element,
            None => return Ok(()),
        };
        match element.run_id() {
            Some(run) => self.process_locked(&element, run),
            None => self.reevaluate(&element),
        }
    }

    /// Start a Run for an unlocked element if its inputs moved
    fn reevaluate(&self, element: &Element) -> Result<()> {
        let id = &element.id;
        let retry = WorkKey::Element(id.clone());
        if element.deleting() {
            return self.start_run(id.namespace(), std::slice::from_ref(id), retry);
        }
        let ps = &element.state;
        if ps.status == Status::Invalid {
            return Ok(());
        }
        let (inputs, problem) = self.gather_inputs(&ps.current.links)?;
        match problem {
            Some(InputProblem::Locked(_)) => return Ok(()),
            Some(InputProblem::Unusable(..)) if ps.status == Status::Blocked => return Ok(()),
            None if ps.status == Status::Completed => {
                if let Some(object_version) = &ps.current.object_version {
                    let fv = self.formal_version(id, object_version, &inputs)?;
                    if ps.current.input_version.as_deref() == Some(fv.as_str()) {
                        return Ok(());
                    }
                }
            }
            _ => {}
        }
        self.start_run(id.namespace(), std::slice::from_ref(id), retry)
    }

    fn handler(&self, id: &ElementId) -> Result<Arc<dyn InternalPhase>> {
        self.registry
            .get(&id.object.type_name)
            .cloned()
            .ok_or_else(|| Error::UnknownType(id.object.type_name.clone()))
    }

    fn process_locked(&self, element: &Element, run: RunId) -> Result<()> {
        let handler = self.handler(&element.id)?;
        let handler = handler.as_ref();
        if element.deleting() {
            return self.process_delete(element, run, handler);
        }
        let target = match &element.state.target {
            Some(target) => target.clone(),
            None => match self.prepare_target(element, run, handler)? {
                Some(target) => target,
                None => return Ok(()),
            },
        };
        let observed = Some(target.object_version.clone());

        let (inputs, problem) = self.gather_inputs(&target.links)?;
        match problem {
            Some(InputProblem::Locked(dep)) => {
                return self.wait(element, run, format!("waiting for {}", dep));
            }
            Some(InputProblem::Unusable(dep, why)) => {
                let message = format!("dependency {} {}", dep, why);
                return self.finish_rollback(element, run, handler, Status::Blocked, message, true, observed);
            }
            None => {}
        }

        let fv = match self.formal_version(&element.id, &target.object_version, &inputs) {
            Ok(fv) => fv,
            Err(e) => {
                return self.finish_rollback(element, run, handler, Status::Failed, e.to_string(), true, observed);
            }
        };
        let current = &element.state.current;
        if current.input_version.as_deref() == Some(fv.as_str())
            && current.object_version.as_deref() == Some(target.object_version.as_str())
        {
            if let Some(output) = current.output.clone() {
                debug!(target: "converge::phase", element = %element.id, "inputs unchanged, reusing output");
                return self.finish_commit(element, run, handler, output, SlaveChanges::default(), fv);
            }
        }

        self.set_status(&element.id, run, Status::Processing, None)?;
        let request = ProcessRequest {
            element: &element.id,
            spec: &target.spec,
            inputs: &inputs,
            current,
            formal_version: &fv,
            deleting: false,
        };
        match self.call_process(handler, &request) {
            ProcessResult::Completed { output, slaves } => {
                self.finish_commit(element, run, handler, output, slaves, fv)
            }
            ProcessResult::Waiting(message) => self.wait(element, run, message),
            ProcessResult::Failed(message) => {
                self.finish_rollback(element, run, handler, Status::Failed, message, true, observed)
            }
            ProcessResult::Deleted => self.remove_phase(element, run),
        }
    }

    /// Accept the triggering spec and record the target
    ///
    /// Returns `None` if the element was finished some other way.
    fn prepare_target(
        &self,
        element: &Element,
        run: RunId,
        handler: &dyn InternalPhase,
    ) -> Result<Option<TargetState>> {
        let external = match self.triggering_external(&element.id.object)? {
            Some(obj) => obj,
            None => {
                self.process_delete(element, run, handler)?;
                return Ok(None);
            }
        };
        let ext = external.as_external().ok_or_else(|| {
            Error::InvalidOperation(format!("{} is not an external object", external.id))
        })?;
        let spec_version = ext.spec_version();
        self.set_status(&element.id, run, Status::Preparing, None)?;

        match handler.accept_external_state(&element.id, &ext.spec) {
            Acceptance::Accept { spec, links } => {
                let type_id = element.id.type_id();
                if let Some(bad) = links.iter().find(|l| {
                    l.namespace() != element.id.namespace()
                        || !self.model.allows_link(&type_id, &l.type_id())
                }) {
                    let message = format!("link to {} is not allowed", bad);
                    self.finish_rollback(element, run, handler, Status::Invalid, message, false, Some(spec_version))?;
                    return Ok(None);
                }
                let mut all: BTreeSet<ElementId> =
                    self.model.local_links(&element.id).into_iter().collect();
                all.extend(links);
                let target = TargetState {
                    object_version: spec_version,
                    spec,
                    links: all.into_iter().collect(),
                };
                self.update_phase(&element.id, |ps| {
                    let changed = ps.set_target(run, target.clone());
                    ((), changed)
                })?;
                Ok(Some(target))
            }
            Acceptance::Reject(message) => {
                self.wait(element, run, message)?;
                Ok(None)
            }
            Acceptance::Invalid(message) => {
                self.finish_rollback(element, run, handler, Status::Invalid, message, false, Some(spec_version))?;
                Ok(None)
            }
        }
    }

    fn process_delete(&self, element: &Element, run: RunId, handler: &dyn InternalPhase) -> Result<()> {
        let spec = element
            .state
            .target
            .as_ref()
            .map(|t| t.spec.clone())
            .or_else(|| element.state.current.spec.clone())
            .unwrap_or(Value::Null);
        let inputs = Inputs::new();
        let request = ProcessRequest {
            element: &element.id,
            spec: &spec,
            inputs: &inputs,
            current: &element.state.current,
            formal_version: "",
            deleting: true,
        };
        match self.call_process(handler, &request) {
            ProcessResult::Waiting(message) => self.wait(element, run, message),
            ProcessResult::Failed(message) => {
                self.finish_rollback(element, run, handler, Status::Failed, message, false, None)?;
                self.retry_later(WorkKey::Element(element.id.clone()));
                Ok(())
            }
            ProcessResult::Completed { slaves, .. } => {
                self.apply_slaves(&element.id, slaves);
                self.remove_phase(element, run)
            }
            ProcessResult::Deleted => self.remove_phase(element, run),
        }
    }

    fn call_process(&self, handler: &dyn InternalPhase, request: &ProcessRequest<'_>) -> ProcessResult {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.process(request))) {
            Ok(result) => result,
            Err(_) => {
                error!(target: "converge::phase", element = %request.element, "process panicked");
                ProcessResult::Failed("process panicked".into())
            }
        }
    }

    /// Committed inputs of `links`, or the first reason they are not ready
    ///
    /// A missing or unusable dependency wins over a locked one.
    pub(crate) fn gather_inputs(&self, links: &[ElementId]) -> Result<(Inputs, Option<InputProblem>)> {
        let mut inputs = Inputs::new();
        let mut locked = None;
        for link in links {
            match Element::load(self.store.as_ref(), link)? {
                None => {
                    let problem = InputProblem::Unusable(link.clone(), "does not exist".into());
                    return Ok((inputs, Some(problem)));
                }
                Some(dep) if dep.run_id().is_some() => {
                    if locked.is_none() {
                        locked = Some(link.clone());
                    }
                }
                Some(dep)
                    if dep.state.status != Status::Completed
                        || dep.state.current.output.is_none() =>
                {
                    let problem = InputProblem::Unusable(link.clone(), format!("is {}", dep.state.status));
                    return Ok((inputs, Some(problem)));
                }
                Some(dep) => {
                    inputs.insert(link.clone(), dep.state.current);
                }
            }
        }
        Ok((inputs, locked.map(InputProblem::Locked)))
    }

    /// Formal version of an element given its spec version and inputs
    ///
    /// Each input contributes its committed output version.
    pub(crate) fn formal_version(&self, element: &ElementId, object_version: &str, inputs: &Inputs) -> Result<String> {
        let root = NodeId::new(element.object.type_name.clone(), version_node_name(element));
        let mut nodes = Vec::with_capacity(inputs.len() + 1);
        let mut deps = Vec::with_capacity(inputs.len());
        for (dep, current) in inputs {
            let id = NodeId::new(dep.object.type_name.clone(), version_node_name(dep));
            let version = current.output_version.clone().unwrap_or_default();
            nodes.push(Node::new(id.clone(), version, Vec::new()));
            deps.push(id);
        }
        nodes.push(Node::new(root.clone(), object_version, deps));
        if self.config.hashed_versions {
            Graph::new(HashedComposer, nodes)?.formal_version(&root)
        } else {
            Graph::new(TextComposer, nodes)?.formal_version(&root)
        }
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    fn set_status(&self, id: &ElementId, run: RunId, status: Status, message: Option<String>) -> Result<()> {
        let changed = self
            .update_phase(id, |ps| {
                let changed = ps.set_status(run, status, message.clone());
                (changed, changed)
            })?
            .unwrap_or(false);
        if changed && status == Status::Waiting {
            self.publish(id, Some(run))?;
        }
        Ok(())
    }

    fn wait(&self, element: &Element, run: RunId, message: String) -> Result<()> {
        debug!(target: "converge::phase", element = %element.id, message = %message, "waiting");
        self.set_status(&element.id, run, Status::Waiting, Some(message))?;
        self.retry_later(WorkKey::Element(element.id.clone()));
        Ok(())
    }

    fn finish_commit(
        &self,
        element: &Element,
        run: RunId,
        handler: &dyn InternalPhase,
        output: Value,
        slaves: SlaveChanges,
        formal_version: String,
    ) -> Result<()> {
        let info = CommitInfo {
            input_version: formal_version,
            output: output.clone(),
        };
        let committed = self
            .update_phase(&element.id, |ps| {
                let committed = ps.commit(run, info.clone());
                (committed, committed)
            })?
            .unwrap_or(false);
        if !committed {
            warn!(target: "converge::phase", run = %run, element = %element.id, "commit lost the lock");
            return Ok(());
        }
        Counters::bump(&self.counters.committed);
        handler.commit(&element.id, &output);
        debug!(target: "converge::phase", run = %run, element = %element.id, "committed");
        self.apply_slaves(&element.id, slaves);
        self.publish(&element.id, Some(run))?;
        self.propagate(&element.id)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_rollback(
        &self,
        element: &Element,
        run: RunId,
        handler: &dyn InternalPhase,
        status: Status,
        message: String,
        keep_links: bool,
        observed: Option<String>,
    ) -> Result<()> {
        let rolled_back = self
            .update_phase(&element.id, |ps| {
                let done = ps.rollback(run, status, Some(message.clone()), keep_links, observed.clone());
                (done, done)
            })?
            .unwrap_or(false);
        if !rolled_back {
            warn!(target: "converge::phase", run = %run, element = %element.id, "rollback lost the lock");
            return Ok(());
        }
        Counters::bump(&self.counters.rolled_back);
        handler.rollback(&element.id, &message);
        info!(target: "converge::phase", run = %run, element = %element.id, status = %status, message = %message, "rolled back");
        self.publish(&element.id, Some(run))?;
        self.propagate(&element.id)
    }

    fn remove_phase(&self, element: &Element, run: RunId) -> Result<()> {
        let id = &element.id;
        let mut obj = match self.store.get_object(&id.object) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => return Ok(()),
            Err(e) => return Err(e),
        };
        let removed = modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
            match data.as_internal_mut() {
                Some(state)
                    if state
                        .phase(&id.phase)
                        .map_or(false, |ps| ps.is_locked_by(run)) =>
                {
                    state.phases.remove(&id.phase);
                    (true, true)
                }
                _ => (false, false),
            }
        })?;
        if !removed {
            return Ok(());
        }
        Counters::bump(&self.counters.deleted);
        debug!(target: "converge::phase", run = %run, element = %id, "phase removed");
        if obj.as_internal().map_or(false, |s| s.phases.is_empty()) {
            self.remove_object(&id.object)?;
        }
        self.publish(id, Some(run))?;
        self.propagate(id)
    }

    /// Create, update or delete objects owned by `owner`
    ///
    /// Failures are logged; the owner's commit stands.
    fn apply_slaves(&self, owner: &ElementId, slaves: SlaveChanges) {
        if slaves.is_empty() {
            return;
        }
        let allowed = self.model.slave_types(&owner.object.type_name);
        let permitted = |id: &ObjectId| {
            let ok = allowed.iter().any(|t| *t == id.type_name) && id.namespace == owner.namespace();
            if !ok {
                warn!(target: "converge::phase", owner = %owner, slave = %id, "slave not allowed");
            }
            ok
        };
        for (id, spec) in slaves.apply {
            if !permitted(&id) {
                continue;
            }
            if let Err(e) = self.apply_external(id.clone(), spec) {
                warn!(target: "converge::phase", owner = %owner, slave = %id, error = %e, "slave write failed");
            }
        }
        for id in slaves.delete {
            if !permitted(&id) {
                continue;
            }
            match self.store.delete_object(&id) {
                Ok(()) => {}
                Err(e) if e.is_not_exist() => {}
                Err(e) => {
                    warn!(target: "converge::phase", owner = %owner, slave = %id, error = %e, "slave delete failed")
                }
            }
        }
    }

    /// Create an external object or replace its spec
    pub(crate) fn apply_external(&self, id: ObjectId, spec: Value) -> Result<StoredObject> {
        match self.store.get_object(&id) {
            Ok(mut obj) => {
                modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
                    match data.as_external_mut() {
                        Some(ext) if ext.spec != spec => {
                            ext.spec = spec.clone();
                            ((), true)
                        }
                        _ => ((), false),
                    }
                })?;
                Ok(obj)
            }
            Err(e) if e.is_not_exist() => self
                .store
                .create_object(StoredObject::new(id, ObjectData::External(ExternalState::new(spec)))),
            Err(e) => Err(e),
        }
    }

    /// Queue every element depending on `id`
    fn propagate(&self, id: &ElementId) -> Result<()> {
        let view = NamespaceView::load(self.store.as_ref(), &self.model, id.namespace())?;
        for child in view.children(&self.model, id) {
            self.queue.enqueue(WorkKey::Element(child));
        }
        Ok(())
    }

    /// Write the element state into its triggering external object
    fn publish(&self, id: &ElementId, run: Option<RunId>) -> Result<()> {
        let element = Element::load(self.store.as_ref(), id)?;
        let status = element.as_ref().map_or(Status::Deleted, |e| e.state.status);
        self.notify(Some(status), &id.object);
        let ext_id = match self.model.trigger_for(&id.type_id()) {
            Some(t) => id.object.with_type(t),
            None => return Ok(()),
        };
        let mut next = match &element {
            Some(e) => ExternalStatus {
                status: e.state.status,
                message: e.state.message.clone(),
                result: e.state.current.output.clone(),
                observed_version: e.state.current.observed_version.clone(),
                formal_version: e.state.current.input_version.clone(),
                detected_version: None,
                run_id: run,
            },
            None => ExternalStatus {
                status: Status::Deleted,
                run_id: run,
                ..Default::default()
            },
        };
        let mut obj = match self.store.get_object(&ext_id) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => {
                self.notify(Some(status), &ext_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
            match data.as_external_mut() {
                Some(ext) => {
                    next.detected_version = Some(ext.spec_version());
                    if next.run_id.is_none() {
                        next.run_id = ext.status.run_id;
                    }
                    if ext.status == next {
                        ((), false)
                    } else {
                        ext.status = next.clone();
                        ((), true)
                    }
                }
                None => ((), false),
            }
        })?;
        trace!(target: "converge::engine", external = %ext_id, status = %status, "status published");
        self.notify(Some(status), &ext_id);
        Ok(())
    }
}
