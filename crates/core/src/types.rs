//! Core identifier types for converge
//!
//! This module defines the foundational identifiers:
//! - RunId: Unique identifier for one multi-element locking attempt
//! - ObjectId: Persisted object identity (type, namespace, name)
//! - ElementId: One reconcilable unit (object + phase)
//! - TypeId: A (type, phase) pair as declared by the metamodel

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a Run
///
/// A RunId is a wrapper around a UUID v4. A fresh RunId is generated for
/// every attempt to lock a dependency closure and is never reused, even if
/// the attempt is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a RunId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a RunId from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    ///
    /// # Errors
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this RunId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a persisted object: type → namespace → name
///
/// Namespaces are plain strings; the namespace object itself is stored
/// under the metamodel's namespace type with an empty namespace and the
/// namespace string as its name.
///
/// Format: "type/namespace/name"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Object type name
    pub type_name: String,
    /// Owning namespace
    pub namespace: String,
    /// Object name, unique per (type, namespace)
    pub name: String,
}

impl ObjectId {
    /// Create a new object id
    pub fn new(
        type_name: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same namespace and name, different type
    pub fn with_type(&self, type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Element id for one phase of this object
    pub fn element(&self, phase: impl Into<String>) -> ElementId {
        ElementId::new(self.clone(), phase)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.type_name, self.namespace, self.name)
    }
}

/// A (type, phase) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId {
    /// Internal type name
    pub type_name: String,
    /// Phase name
    pub phase: String,
}

impl TypeId {
    /// Create a new type id
    pub fn new(type_name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            phase: phase.into(),
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.phase)
    }
}

/// One reconcilable unit: an internal object and one of its phases
///
/// Format: "type/namespace/name:phase"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    /// The internal object
    pub object: ObjectId,
    /// Phase name
    pub phase: String,
}

impl ElementId {
    /// Create a new element id
    pub fn new(object: ObjectId, phase: impl Into<String>) -> Self {
        Self {
            object,
            phase: phase.into(),
        }
    }

    /// The (type, phase) pair of this element
    pub fn type_id(&self) -> TypeId {
        TypeId::new(self.object.type_name.clone(), self.phase.clone())
    }

    /// Namespace of the underlying object
    pub fn namespace(&self) -> &str {
        &self.object.namespace
    }

    /// Another phase of the same object
    pub fn sibling(&self, phase: impl Into<String>) -> Self {
        Self::new(self.object.clone(), phase)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object, self.phase)
    }
}
