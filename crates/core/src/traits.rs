//! Core traits for the object store abstraction
//!
//! The engine only talks to persistence through [`ObjectStore`], so the
//! in-memory store used by tests and embedders can be swapped for a
//! durable one without touching the locking protocol.

use std::sync::Arc;

use crate::error::Result;
use crate::object::StoredObject;
use crate::types::ObjectId;

/// Receives change notifications from a store
///
/// Called after a write is visible and outside any store lock. Handlers
/// should hand the id off to a queue rather than do work inline.
pub trait ChangeHandler: Send + Sync {
    /// `id` was created, updated or deleted
    fn handle_change(&self, id: &ObjectId);
}

impl<F> ChangeHandler for F
where
    F: Fn(&ObjectId) + Send + Sync,
{
    fn handle_change(&self, id: &ObjectId) {
        self(id)
    }
}

/// Selects which changes a handler receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerFilter {
    /// Object types of interest (empty = all)
    pub types: Vec<String>,
    /// Namespace of interest (None = all)
    pub namespace: Option<String>,
    /// Also match namespaces nested below `namespace` (`ns/...`)
    pub recursive: bool,
}

impl HandlerFilter {
    /// Match every change
    pub fn all() -> Self {
        Self::default()
    }

    /// Match the given types in every namespace
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Restrict to one namespace, optionally including nested ones
    pub fn in_namespace(mut self, namespace: impl Into<String>, recursive: bool) -> Self {
        self.namespace = Some(namespace.into());
        self.recursive = recursive;
        self
    }

    /// Does a change of `id` pass this filter
    pub fn matches(&self, id: &ObjectId) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == id.type_name) {
            return false;
        }
        match &self.namespace {
            None => true,
            Some(ns) if *ns == id.namespace => true,
            Some(ns) => {
                self.recursive
                    && id.namespace.len() > ns.len()
                    && id.namespace.starts_with(ns.as_str())
                    && id.namespace.as_bytes()[ns.len()] == b'/'
            }
        }
    }
}

/// Versioned object storage with optimistic compare-and-set
///
/// Every successful write assigns the object a fresh, store-wide
/// monotonically increasing version. Thread safety: all methods must be
/// safe to call concurrently from multiple threads.
pub trait ObjectStore: Send + Sync {
    /// Read an object
    ///
    /// # Errors
    ///
    /// `NotExist` if the object is absent.
    fn get_object(&self, id: &ObjectId) -> Result<StoredObject>;

    /// Create an object, ignoring `obj.version`
    ///
    /// Returns the stored object with its assigned version.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken.
    fn create_object(&self, obj: StoredObject) -> Result<StoredObject>;

    /// Compare-and-set write
    ///
    /// Writes `obj` only if the stored version still equals `obj.version`,
    /// returning the new version.
    ///
    /// # Errors
    ///
    /// `Outdated` on a version mismatch, `NotExist` if the object is absent.
    fn set_object(&self, obj: &StoredObject) -> Result<u64>;

    /// Delete an object
    ///
    /// # Errors
    ///
    /// `NotExist` if the object is absent.
    fn delete_object(&self, id: &ObjectId) -> Result<()>;

    /// All objects of one type in one namespace, sorted by id
    fn list_objects(&self, type_name: &str, namespace: &str) -> Result<Vec<StoredObject>>;

    /// All objects in one namespace, sorted by id
    fn list_namespace(&self, namespace: &str) -> Result<Vec<StoredObject>>;

    /// Ids of every stored object, sorted
    fn list_all(&self) -> Result<Vec<ObjectId>>;

    /// Subscribe to changes passing `filter`
    fn register_handler(&self, handler: Arc<dyn ChangeHandler>, filter: HandlerFilter);

    /// Get current global version
    fn current_version(&self) -> u64;
}
