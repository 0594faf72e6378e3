//! Run-based graph locking
//!
//! A Run owns a set of elements: the roots it was started for plus every
//! element transitively depending on them. Acquisition is all or nothing:
//!
//! 1. take the namespace run lock (in-process guard, then the persisted
//!    `run_lock` via compare-and-set)
//! 2. snapshot the namespace and compute the closure of the roots; give up
//!    if any member is already locked
//! 3. lock every member individually; give up on the first failure
//! 4. release the namespace run lock
//!
//! Giving up releases whatever was taken. A release that fails against the
//! store is recorded and retried through [`WorkKey::Namespace`].

use crate::element::NamespaceView;
use crate::engine::{Counters, EngineInner, WorkKey};
use converge_core::error::Result;
use converge_core::{
    ElementId, NamespaceState, ObjectData, ObjectId, PhaseState, PriorStatus, RunId, StoredObject,
};
use converge_storage::modify;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Elements locked for one Run
#[derive(Debug, Clone)]
pub(crate) struct Run {
    pub(crate) id: RunId,
    pub(crate) elements: BTreeSet<ElementId>,
}

/// Locks of an aborted attempt that could not be released yet
#[derive(Debug, Clone)]
pub(crate) struct PendingRelease {
    pub(crate) run: RunId,
    pub(crate) elements: BTreeMap<ElementId, PriorStatus>,
}

/// Undoes a locking attempt on drop
///
/// `pending` holds the element locks taken so far with the status and
/// message each element had before; a granted Run clears it so only the
/// namespace lock is released.
struct RunCleanup<'a> {
    engine: &'a EngineInner,
    namespace: &'a str,
    run: RunId,
    pending: BTreeMap<ElementId, PriorStatus>,
}

impl Drop for RunCleanup<'_> {
    fn drop(&mut self) {
        let mut failed = BTreeMap::new();
        for (element, previous) in std::mem::take(&mut self.pending) {
            if let Err(e) = self.engine.release_element(&element, self.run, previous.clone()) {
                warn!(target: "converge::lock", element = %element, error = %e, "element release failed");
                failed.insert(element, previous);
            }
        }
        if failed.is_empty() {
            match self.engine.release_namespace(self.namespace, self.run) {
                Ok(()) => return,
                Err(e) => {
                    warn!(target: "converge::lock", namespace = self.namespace, error = %e, "namespace release failed")
                }
            }
        }
        self.engine.releases.insert(
            self.namespace.to_string(),
            PendingRelease {
                run: self.run,
                elements: failed,
            },
        );
        self.engine
            .retry_later(WorkKey::Namespace(self.namespace.to_string()));
    }
}

impl EngineInner {
    fn namespace_id(&self, namespace: &str) -> ObjectId {
        ObjectId::new(self.model.namespace_type(), "", namespace)
    }

    /// Lock `roots` and their dependent closure for a new Run
    ///
    /// Returns `None` if anything in the way is busy; the caller retries
    /// later.
    pub(crate) fn lock_graph(&self, namespace: &str, roots: &[ElementId]) -> Result<Option<Run>> {
        let key = namespace.to_string();
        let _local = match self.ns_locks.try_guard(&key) {
            Some(guard) => guard,
            None => {
                debug!(target: "converge::lock", namespace, "namespace busy in process");
                Counters::bump(&self.counters.runs_aborted);
                return Ok(None);
            }
        };

        let run = RunId::new();
        if !self.acquire_namespace(namespace, run)? {
            debug!(target: "converge::lock", namespace, "namespace run lock held");
            Counters::bump(&self.counters.runs_aborted);
            return Ok(None);
        }
        let mut cleanup = RunCleanup {
            engine: self,
            namespace,
            run,
            pending: BTreeMap::new(),
        };

        // The snapshot is not synchronized with commits of Runs already
        // granted: a link added after it was taken is not followed, so such a
        // dependent can join a second concurrent Run.
        let view = NamespaceView::load(self.store.as_ref(), &self.model, namespace)?;
        let closure = view.closure(&self.model, roots);
        if let Some(busy) = closure
            .iter()
            .find(|e| view.get(e).map_or(false, PhaseState::is_locked))
        {
            debug!(target: "converge::lock", run = %run, element = %busy, "closure member locked");
            Counters::bump(&self.counters.runs_aborted);
            return Ok(None);
        }

        for element in &closure {
            match self.lock_element(element, run)? {
                Some(previous) => {
                    cleanup.pending.insert(element.clone(), previous);
                }
                None => {
                    debug!(target: "converge::lock", run = %run, element = %element, "element lock lost");
                    Counters::bump(&self.counters.runs_aborted);
                    return Ok(None);
                }
            }
        }

        cleanup.pending.clear();
        drop(cleanup);
        Counters::bump(&self.counters.runs_granted);
        info!(target: "converge::lock", run = %run, namespace, elements = closure.len(), "run granted");
        Ok(Some(Run {
            id: run,
            elements: closure,
        }))
    }

    /// Persisted namespace lock; `false` if another Run holds it
    fn acquire_namespace(&self, namespace: &str, run: RunId) -> Result<bool> {
        let id = self.namespace_id(namespace);
        let mut obj = match self.store.get_object(&id) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => {
                let fresh = StoredObject::new(
                    id,
                    ObjectData::Namespace(NamespaceState {
                        run_lock: Some(run),
                    }),
                );
                return match self.store.create_object(fresh) {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_retryable() => Ok(false),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        if !obj.as_namespace_mut().map_or(false, |ns| ns.try_lock(run)) {
            return Ok(false);
        }
        match self.store.set_object(&obj) {
            Ok(_) => Ok(true),
            Err(e) if e.is_outdated() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn release_namespace(&self, namespace: &str, run: RunId) -> Result<()> {
        let mut obj = match self.store.get_object(&self.namespace_id(namespace)) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => return Ok(()),
            Err(e) => return Err(e),
        };
        modify(self.store.as_ref(), &mut obj, &self.retry, |data| match data {
            ObjectData::Namespace(ns) => {
                let changed = ns.unlock(run);
                ((), changed)
            }
            _ => ((), false),
        })
    }

    /// Individual element lock; returns the state to restore on release
    fn lock_element(&self, element: &ElementId, run: RunId) -> Result<Option<PriorStatus>> {
        self.update_phase(element, |ps| {
            let previous = ps.prior();
            if ps.try_lock(run) {
                (Some(previous), true)
            } else {
                (None, false)
            }
        })
        .map(Option::flatten)
    }

    pub(crate) fn release_element(
        &self,
        element: &ElementId,
        run: RunId,
        previous: PriorStatus,
    ) -> Result<()> {
        self.update_phase(element, |ps| {
            let changed = ps.release(run, previous.clone());
            ((), changed)
        })
        .map(|_| ())
    }

    /// Read-modify-write one phase of an internal object
    ///
    /// Returns `None` if the object or phase does not exist.
    pub(crate) fn update_phase<R, F>(&self, element: &ElementId, mut f: F) -> Result<Option<R>>
    where
        F: FnMut(&mut PhaseState) -> (R, bool),
    {
        let mut obj = match self.store.get_object(&element.object) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => return Ok(None),
            Err(e) => return Err(e),
        };
        modify(self.store.as_ref(), &mut obj, &self.retry, |data| {
            match data
                .as_internal_mut()
                .and_then(|s| s.phase_mut(&element.phase))
            {
                Some(ps) => {
                    let (r, changed) = f(ps);
                    (Some(r), changed)
                }
                None => (None, false),
            }
        })
    }

    /// Finish releasing locks of an aborted Run, or clear a stale lock
    ///
    /// Stale lock clearing is only sound with a single engine per store; a
    /// peer process acquiring in the same namespace would lose its lock.
    pub(crate) fn reconcile_namespace(&self, namespace: &str) -> Result<()> {
        if let Some((_, pending)) = self.releases.remove(namespace) {
            info!(target: "converge::lock", run = %pending.run, namespace, "retrying lock release");
            drop(RunCleanup {
                engine: self,
                namespace,
                run: pending.run,
                pending: pending.elements,
            });
            return Ok(());
        }

        // Assumes this engine is the only process driving the store: with
        // the in-process guard held and nothing pending, a persisted lock can
        // only be left over from an interrupted process.
        let key = namespace.to_string();
        let _local = match self.ns_locks.try_guard(&key) {
            Some(guard) => guard,
            None => return Ok(()),
        };
        let mut obj = match self.store.get_object(&self.namespace_id(namespace)) {
            Ok(obj) => obj,
            Err(e) if e.is_not_exist() => return Ok(()),
            Err(e) => return Err(e),
        };
        let stale = modify(self.store.as_ref(), &mut obj, &self.retry, |data| match data {
            ObjectData::Namespace(ns) => match ns.run_lock.take() {
                Some(run) => (Some(run), true),
                None => (None, false),
            },
            _ => (None, false),
        })?;
        if let Some(run) = stale {
            warn!(target: "converge::lock", run = %run, namespace, "cleared stale namespace lock");
        }
        Ok(())
    }
}
