//! Table of internal type implementations
//!
//! Built once by the embedder and checked against the metamodel when the
//! engine is constructed: every internal type needs an implementation and
//! every implementation must name an internal type.

use crate::phase::InternalPhase;
use converge_core::error::{Error, Result};
use converge_core::MetaModel;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Internal type name → implementation
#[derive(Default, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<String, Arc<dyn InternalPhase>>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation of `type_name`
    ///
    /// # Errors
    ///
    /// `InvalidModel` if the type is already registered.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        handler: Arc<dyn InternalPhase>,
    ) -> Result<()> {
        let type_name = type_name.into();
        if self.types.contains_key(&type_name) {
            return Err(Error::InvalidModel(format!(
                "type {} registered twice",
                type_name
            )));
        }
        self.types.insert(type_name, handler);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, type_name: impl Into<String>, handler: Arc<dyn InternalPhase>) -> Result<Self> {
        self.register(type_name, handler)?;
        Ok(self)
    }

    /// Implementation of `type_name`
    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn InternalPhase>> {
        self.types.get(type_name)
    }

    /// Registered type names
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|s| s.as_str())
    }

    /// Check that registry and metamodel describe the same internal types
    ///
    /// # Errors
    ///
    /// `UnknownType` naming the first mismatch.
    pub fn validate(&self, model: &MetaModel) -> Result<()> {
        if let Some(missing) = model.internal_types().find(|t| !self.types.contains_key(*t)) {
            return Err(Error::UnknownType(format!(
                "{} has no registered implementation",
                missing
            )));
        }
        if let Some(extra) = self.type_names().find(|t| !model.is_internal(t)) {
            return Err(Error::UnknownType(format!(
                "{} is not an internal type of model {}",
                extra,
                model.name()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}
