//! Sharded in-memory object store
//!
//! Objects are partitioned by namespace: a DashMap keyed by namespace
//! holds one FxHashMap per namespace. Writes lock only the target
//! namespace's shard, so reconciliation in different namespaces never
//! contends on the store.
//!
//! # Version Handling
//!
//! A single store-wide AtomicU64 hands out versions. Every successful
//! write, including compare-and-set updates, stamps the object with a
//! fresh version, so `version` both orders writes and serves as the
//! compare-and-set token.
//!
//! # Notifications
//!
//! Change handlers run after the shard lock is released, in the writing
//! thread. A handler may therefore read or write the store itself.

use converge_core::error::{Error, Result};
use converge_core::traits::{ChangeHandler, HandlerFilter, ObjectStore};
use converge_core::{ObjectId, StoredObject};
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Objects of one namespace
#[derive(Debug, Default)]
pub struct Shard {
    pub(crate) data: FxHashMap<ObjectId, StoredObject>,
}

impl Shard {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of objects in this shard
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if shard is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Registration {
    filter: HandlerFilter,
    handler: Arc<dyn ChangeHandler>,
}

/// Sharded in-memory store - DashMap by namespace, FxHashMap within
///
/// # Example
///
/// ```
/// use converge_core::{ExternalState, ObjectData, ObjectId, ObjectStore, StoredObject};
/// use converge_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// let id = ObjectId::new("Value", "ns", "A");
/// let obj = StoredObject::new(id.clone(), ObjectData::External(ExternalState::new(5.into())));
/// let created = store.create_object(obj).unwrap();
/// assert_eq!(store.get_object(&id).unwrap().version, created.version);
/// ```
pub struct MemoryStore {
    shards: DashMap<String, Shard>,
    version: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
}

impl MemoryStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
            version: AtomicU64::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Create with expected number of namespaces
    pub fn with_capacity(num_namespaces: usize) -> Self {
        Self {
            shards: DashMap::with_capacity(num_namespaces),
            version: AtomicU64::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Increment version and return new value
    #[inline]
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get number of namespace shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get total number of objects across all shards
    pub fn total_entries(&self) -> usize {
        self.shards.iter().map(|entry| entry.value().len()).sum()
    }

    /// Check if an object exists
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.shards
            .get(&id.namespace)
            .map(|shard| shard.data.contains_key(id))
            .unwrap_or(false)
    }

    fn notify(&self, id: &ObjectId) {
        let targets: Vec<Arc<dyn ChangeHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|r| r.filter.matches(id))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        trace!(target: "converge::store", object = %id, handlers = targets.len(), "change");
        for handler in targets {
            handler.handle_change(id);
        }
    }

    fn collect_sorted<F>(&self, namespace: &str, pred: F) -> Vec<StoredObject>
    where
        F: Fn(&StoredObject) -> bool,
    {
        let mut result: Vec<StoredObject> = self
            .shards
            .get(namespace)
            .map(|shard| shard.data.values().filter(|o| pred(o)).cloned().collect())
            .unwrap_or_default();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn get_object(&self, id: &ObjectId) -> Result<StoredObject> {
        self.shards
            .get(&id.namespace)
            .and_then(|shard| shard.data.get(id).cloned())
            .ok_or_else(|| Error::NotExist(id.clone()))
    }

    fn create_object(&self, mut obj: StoredObject) -> Result<StoredObject> {
        {
            let mut shard = self.shards.entry(obj.id.namespace.clone()).or_default();
            if shard.data.contains_key(&obj.id) {
                return Err(Error::AlreadyExists(obj.id));
            }
            obj.version = self.next_version();
            shard.data.insert(obj.id.clone(), obj.clone());
        }
        self.notify(&obj.id);
        Ok(obj)
    }

    fn set_object(&self, obj: &StoredObject) -> Result<u64> {
        let version = {
            let mut shard = self
                .shards
                .get_mut(&obj.id.namespace)
                .ok_or_else(|| Error::NotExist(obj.id.clone()))?;
            let stored = shard
                .data
                .get_mut(&obj.id)
                .ok_or_else(|| Error::NotExist(obj.id.clone()))?;
            if stored.version != obj.version {
                return Err(Error::Outdated(obj.id.clone()));
            }
            let version = self.next_version();
            *stored = obj.clone();
            stored.version = version;
            version
        };
        self.notify(&obj.id);
        Ok(version)
    }

    fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let removed = self
            .shards
            .get_mut(&id.namespace)
            .and_then(|mut shard| shard.data.remove(id));
        if removed.is_none() {
            return Err(Error::NotExist(id.clone()));
        }
        self.next_version();
        self.notify(id);
        Ok(())
    }

    fn list_objects(&self, type_name: &str, namespace: &str) -> Result<Vec<StoredObject>> {
        Ok(self.collect_sorted(namespace, |o| o.id.type_name == type_name))
    }

    fn list_namespace(&self, namespace: &str) -> Result<Vec<StoredObject>> {
        Ok(self.collect_sorted(namespace, |_| true))
    }

    fn list_all(&self) -> Result<Vec<ObjectId>> {
        let mut ids: Vec<ObjectId> = self
            .shards
            .iter()
            .flat_map(|shard| shard.data.keys().cloned().collect::<Vec<_>>())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn register_handler(&self, handler: Arc<dyn ChangeHandler>, filter: HandlerFilter) {
        self.handlers.write().push(Registration { filter, handler });
    }

    fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
