//! MetaModel: the validated, immutable description of a reconciliation domain
//!
//! A metamodel names:
//! - the namespace type (exactly one)
//! - external types, each triggering one internal (type, phase)
//! - internal types, each with an ordered phase list; every phase declares
//!   the (type, phase) pairs it depends on
//! - optionally, the external types an internal type may create as slaves
//!
//! The model is built once from a [`MetaModelSpec`] and never mutated. All
//! queries are pure lookups over precomputed tables.
//!
//! # Example
//!
//! ```
//! use converge_core::metamodel::{MetaModel, MetaModelSpec, PhaseSpec};
//! use converge_core::TypeId;
//!
//! let spec = MetaModelSpec::new("Namespace")
//!     .external_type("Value", "ValueState", "calc")
//!     .internal_type("ValueState", vec![PhaseSpec::new("calc")]);
//! let model = MetaModel::new("demo", spec).unwrap();
//! assert_eq!(model.triggered_by("Value"), Some(&TypeId::new("ValueState", "calc")));
//! ```

use crate::dag::check_acyclic;
use crate::error::{Error, Result};
use crate::types::{ElementId, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// Specification
// ============================================================================

/// Declaration of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase name
    pub name: String,
    /// (type, phase) pairs this phase consumes
    #[serde(default)]
    pub dependencies: Vec<TypeId>,
}

impl PhaseSpec {
    /// Phase without dependencies
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, type_name: impl Into<String>, phase: impl Into<String>) -> Self {
        self.dependencies.push(TypeId::new(type_name, phase));
        self
    }
}

/// Declaration of one internal type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTypeSpec {
    /// Type name
    pub name: String,
    /// Ordered phases
    pub phases: Vec<PhaseSpec>,
    /// External types this type may create as slave objects
    #[serde(default)]
    pub slaves: Vec<String>,
}

/// Declaration of one external type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTypeSpec {
    /// Type name
    pub name: String,
    /// Internal (type, phase) the external type drives
    pub trigger: TypeId,
}

/// Unvalidated metamodel description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaModelSpec {
    /// Namespace type name
    pub namespace_type: String,
    /// External types
    #[serde(default)]
    pub external_types: Vec<ExternalTypeSpec>,
    /// Internal types
    #[serde(default)]
    pub internal_types: Vec<InternalTypeSpec>,
}

impl MetaModelSpec {
    /// Start a specification with the given namespace type
    pub fn new(namespace_type: impl Into<String>) -> Self {
        Self {
            namespace_type: namespace_type.into(),
            ..Default::default()
        }
    }

    /// Add an external type triggering `internal:phase`
    pub fn external_type(
        mut self,
        name: impl Into<String>,
        internal: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        self.external_types.push(ExternalTypeSpec {
            name: name.into(),
            trigger: TypeId::new(internal, phase),
        });
        self
    }

    /// Add an internal type
    pub fn internal_type(mut self, name: impl Into<String>, phases: Vec<PhaseSpec>) -> Self {
        self.internal_types.push(InternalTypeSpec {
            name: name.into(),
            phases,
            slaves: Vec::new(),
        });
        self
    }

    /// Allow the most recently added internal type to create slaves of `external`
    pub fn with_slave(mut self, external: impl Into<String>) -> Self {
        if let Some(last) = self.internal_types.last_mut() {
            last.slaves.push(external.into());
        }
        self
    }
}

// ============================================================================
// Validated model
// ============================================================================

#[derive(Debug, Clone)]
struct InternalTypeInfo {
    phases: Vec<String>,
    dependencies: HashMap<String, Vec<TypeId>>,
    trigger: HashMap<String, String>,
    slaves: Vec<String>,
}

/// Validated, immutable metamodel
#[derive(Debug, Clone)]
pub struct MetaModel {
    name: String,
    namespace_type: String,
    external: BTreeMap<String, TypeId>,
    internal: BTreeMap<String, InternalTypeInfo>,
    dependents: HashMap<TypeId, Vec<TypeId>>,
}

impl MetaModel {
    /// Validate a specification and build the model
    ///
    /// # Errors
    ///
    /// - `InvalidModel` if the namespace type is missing or reused, a type is
    ///   declared twice, or a trigger, dependency, or slave references an
    ///   unknown type/phase
    /// - `DependencyCycle` if the phase dependency graph has a cycle
    pub fn new(name: impl Into<String>, spec: MetaModelSpec) -> Result<Self> {
        if spec.namespace_type.is_empty() {
            return Err(Error::InvalidModel("no namespace type".to_string()));
        }

        let mut internal = BTreeMap::new();
        for it in &spec.internal_types {
            if it.name == spec.namespace_type || internal.contains_key(&it.name) {
                return Err(Error::InvalidModel(format!(
                    "internal type {} declared twice",
                    it.name
                )));
            }
            if it.phases.is_empty() {
                return Err(Error::InvalidModel(format!(
                    "internal type {} has no phases",
                    it.name
                )));
            }
            let mut phases = Vec::with_capacity(it.phases.len());
            let mut dependencies = HashMap::new();
            for p in &it.phases {
                if dependencies.contains_key(&p.name) {
                    return Err(Error::InvalidModel(format!(
                        "phase {}:{} declared twice",
                        it.name, p.name
                    )));
                }
                phases.push(p.name.clone());
                dependencies.insert(p.name.clone(), p.dependencies.clone());
            }
            internal.insert(
                it.name.clone(),
                InternalTypeInfo {
                    phases,
                    dependencies,
                    trigger: HashMap::new(),
                    slaves: it.slaves.clone(),
                },
            );
        }

        let mut external = BTreeMap::new();
        for et in &spec.external_types {
            if et.name == spec.namespace_type
                || internal.contains_key(&et.name)
                || external.contains_key(&et.name)
            {
                return Err(Error::InvalidModel(format!(
                    "external type {} declared twice",
                    et.name
                )));
            }
            let info = internal.get_mut(&et.trigger.type_name).ok_or_else(|| {
                Error::InvalidModel(format!(
                    "external type {} triggers unknown internal type {}",
                    et.name, et.trigger.type_name
                ))
            })?;
            if !info.dependencies.contains_key(&et.trigger.phase) {
                return Err(Error::InvalidModel(format!(
                    "external type {} triggers unknown phase {}",
                    et.name, et.trigger
                )));
            }
            if let Some(other) = info.trigger.get(&et.trigger.phase) {
                return Err(Error::InvalidModel(format!(
                    "phase {} triggered by both {} and {}",
                    et.trigger, other, et.name
                )));
            }
            info.trigger
                .insert(et.trigger.phase.clone(), et.name.clone());
            external.insert(et.name.clone(), et.trigger.clone());
        }

        let mut edges: BTreeMap<TypeId, Vec<TypeId>> = BTreeMap::new();
        let mut dependents: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for (type_name, info) in &internal {
            for slave in &info.slaves {
                if !external.contains_key(slave) {
                    return Err(Error::InvalidModel(format!(
                        "internal type {} declares unknown slave type {}",
                        type_name, slave
                    )));
                }
            }
            for phase in &info.phases {
                let from = TypeId::new(type_name.clone(), phase.clone());
                let deps = &info.dependencies[phase];
                for dep in deps {
                    let known = internal
                        .get(&dep.type_name)
                        .map(|i| i.dependencies.contains_key(&dep.phase))
                        .unwrap_or(false);
                    if !known {
                        return Err(Error::InvalidModel(format!(
                            "phase {} depends on unknown phase {}",
                            from, dep
                        )));
                    }
                    dependents.entry(dep.clone()).or_default().push(from.clone());
                }
                edges.insert(from, deps.clone());
            }
        }
        check_acyclic(&edges)?;

        Ok(Self {
            name: name.into(),
            namespace_type: spec.namespace_type,
            external,
            internal,
            dependents,
        })
    }

    /// Model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace type name
    pub fn namespace_type(&self) -> &str {
        &self.namespace_type
    }

    /// External type names
    pub fn external_types(&self) -> impl Iterator<Item = &str> {
        self.external.keys().map(|s| s.as_str())
    }

    /// Internal type names
    pub fn internal_types(&self) -> impl Iterator<Item = &str> {
        self.internal.keys().map(|s| s.as_str())
    }

    /// Is `type_name` an external type
    pub fn is_external(&self, type_name: &str) -> bool {
        self.external.contains_key(type_name)
    }

    /// Is `type_name` an internal type
    pub fn is_internal(&self, type_name: &str) -> bool {
        self.internal.contains_key(type_name)
    }

    /// Ordered phases of an internal type
    pub fn phases(&self, type_name: &str) -> Option<&[String]> {
        self.internal.get(type_name).map(|i| i.phases.as_slice())
    }

    /// Declared dependencies of a (type, phase)
    pub fn dependencies(&self, id: &TypeId) -> Option<&[TypeId]> {
        self.internal
            .get(&id.type_name)
            .and_then(|i| i.dependencies.get(&id.phase))
            .map(|d| d.as_slice())
    }

    /// Does `id` declare a dependency on `dep`
    pub fn allows_link(&self, id: &TypeId, dep: &TypeId) -> bool {
        self.dependencies(id)
            .map(|deps| deps.contains(dep))
            .unwrap_or(false)
    }

    /// (type, phase) pairs that directly depend on `id`
    pub fn dependent_types(&self, id: &TypeId) -> &[TypeId] {
        self.dependents.get(id).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Internal (type, phase) driven by an external type
    pub fn triggered_by(&self, external_type: &str) -> Option<&TypeId> {
        self.external.get(external_type)
    }

    /// External type driving an internal (type, phase), if any
    pub fn trigger_for(&self, id: &TypeId) -> Option<&str> {
        self.internal
            .get(&id.type_name)
            .and_then(|i| i.trigger.get(&id.phase))
            .map(|s| s.as_str())
    }

    /// All external types driving phases of an internal type
    pub fn triggering_types_for(&self, type_name: &str) -> Vec<&str> {
        match self.internal.get(type_name) {
            Some(info) => info
                .phases
                .iter()
                .filter_map(|p| info.trigger.get(p).map(|s| s.as_str()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// External types an internal type may create as slaves
    pub fn slave_types(&self, type_name: &str) -> &[String] {
        self.internal
            .get(type_name)
            .map(|i| i.slaves.as_slice())
            .unwrap_or(&[])
    }

    /// Phases to pre-lock when an object of `type_name` is newly created
    ///
    /// These are the type's own phases together with every phase of the same
    /// type that transitively depends on one of them.
    pub fn dependent_type_phases(&self, type_name: &str) -> Vec<TypeId> {
        let info = match self.internal.get(type_name) {
            Some(info) => info,
            None => return Vec::new(),
        };
        let mut result: BTreeSet<TypeId> = info
            .phases
            .iter()
            .map(|p| TypeId::new(type_name, p.clone()))
            .collect();
        let mut pending: Vec<TypeId> = result.iter().cloned().collect();
        while let Some(id) = pending.pop() {
            for dep in self.dependent_types(&id) {
                if dep.type_name == type_name && result.insert(dep.clone()) {
                    pending.push(dep.clone());
                }
            }
        }
        let order = |t: &TypeId| info.phases.iter().position(|p| *p == t.phase);
        let mut list: Vec<TypeId> = result.into_iter().collect();
        list.sort_by_key(order);
        list
    }

    /// Links implied by same-object phase dependencies
    ///
    /// If phase P of type T depends on (T, Q), every element `T/ns/n:P`
    /// implicitly links `T/ns/n:Q`.
    pub fn local_links(&self, element: &ElementId) -> Vec<ElementId> {
        self.dependencies(&element.type_id())
            .unwrap_or(&[])
            .iter()
            .filter(|d| d.type_name == element.object.type_name)
            .map(|d| element.sibling(d.phase.clone()))
            .collect()
    }

    /// Same-object phases directly depending on `element`'s phase
    pub fn local_dependents(&self, element: &ElementId) -> Vec<ElementId> {
        self.dependent_types(&element.type_id())
            .iter()
            .filter(|d| d.type_name == element.object.type_name)
            .map(|d| element.sibling(d.phase.clone()))
            .collect()
    }
}
