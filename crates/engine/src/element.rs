//! Runtime view of elements
//!
//! Elements are never persisted on their own: an [`Element`] is rebuilt
//! from its internal object whenever it is needed, and a [`NamespaceView`]
//! is a snapshot of every element in one namespace used to compute
//! dependent closures.

use converge_core::error::Result;
use converge_core::{
    ElementId, MetaModel, ObjectData, ObjectStore, PhaseState, RunId, StoredObject,
};
use std::collections::{BTreeMap, BTreeSet};

/// One (internal object, phase) as currently stored
#[derive(Debug, Clone)]
pub struct Element {
    /// Element id
    pub id: ElementId,
    /// Owning internal object as read
    pub object: StoredObject,
    /// Phase state as read
    pub state: PhaseState,
}

impl Element {
    /// Read an element
    ///
    /// Returns `None` if the object or the phase does not exist.
    pub fn load<S: ObjectStore + ?Sized>(store: &S, id: &ElementId) -> Result<Option<Self>> {
        let object = match store.get_object(&id.object) {
            Ok(object) => object,
            Err(e) if e.is_not_exist() => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = match object.as_internal().and_then(|i| i.phase(&id.phase)) {
            Some(state) => state.clone(),
            None => return Ok(None),
        };
        Ok(Some(Self {
            id: id.clone(),
            object,
            state,
        }))
    }

    /// Lock holder
    pub fn run_id(&self) -> Option<RunId> {
        self.state.run_id
    }

    /// The triggering external object is gone
    pub fn deleting(&self) -> bool {
        self.object.as_internal().map_or(false, |i| i.deleting)
    }
}

/// Snapshot of all elements in one namespace
#[derive(Debug, Default)]
pub struct NamespaceView {
    elements: BTreeMap<ElementId, PhaseState>,
}

impl NamespaceView {
    /// Read every internal object of `namespace`
    pub fn load<S: ObjectStore + ?Sized>(
        store: &S,
        model: &MetaModel,
        namespace: &str,
    ) -> Result<Self> {
        let mut elements = BTreeMap::new();
        for object in store.list_namespace(namespace)? {
            if !model.is_internal(&object.id.type_name) {
                continue;
            }
            if let ObjectData::Internal(state) = object.data {
                for (phase, ps) in state.phases {
                    elements.insert(ElementId::new(object.id.clone(), phase), ps);
                }
            }
        }
        Ok(Self { elements })
    }

    /// State of one element
    pub fn get(&self, id: &ElementId) -> Option<&PhaseState> {
        self.elements.get(id)
    }

    /// All elements
    pub fn iter(&self) -> impl Iterator<Item = (&ElementId, &PhaseState)> {
        self.elements.iter()
    }

    /// Elements that directly depend on `id`
    ///
    /// Same-object phases declared as dependents in the model, plus every
    /// element whose current or target links name `id`.
    pub fn children(&self, model: &MetaModel, id: &ElementId) -> BTreeSet<ElementId> {
        let mut out: BTreeSet<ElementId> = model
            .local_dependents(id)
            .into_iter()
            .filter(|e| self.elements.contains_key(e))
            .collect();
        for (other, ps) in &self.elements {
            if other != id && ps.all_links().any(|l| l == id) {
                out.insert(other.clone());
            }
        }
        out
    }

    /// `roots` and everything transitively depending on them
    ///
    /// Roots are included even if absent from the snapshot.
    pub fn closure<'a, I>(&self, model: &MetaModel, roots: I) -> BTreeSet<ElementId>
    where
        I: IntoIterator<Item = &'a ElementId>,
    {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<ElementId> = roots.into_iter().cloned().collect();
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            pending.extend(
                self.children(model, &id)
                    .into_iter()
                    .filter(|c| !seen.contains(c)),
            );
        }
        seen
    }
}

/// Node name used in element formal versions: `namespace/name/phase`
pub(crate) fn version_node_name(id: &ElementId) -> String {
    format!("{}/{}/{}", id.object.namespace, id.object.name, id.phase)
}
