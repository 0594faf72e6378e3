//! The reconciliation engine
//!
//! [`Engine`] wires a store, a metamodel and a type registry to a keyed
//! worker pool. Store notifications about external objects become
//! [`WorkKey::External`] items; the locking protocol turns a detected
//! change into a Run and queues every element of its closure as
//! [`WorkKey::Element`]; failed lock releases come back as
//! [`WorkKey::Namespace`].

use crate::config::EngineConfig;
use crate::locking::PendingRelease;
use crate::registry::TypeRegistry;
use converge_concurrency::{
    Action, Context, EventManager, Future, Pool, PoolHandle, PoolStats, Status as PoolStatus,
};
use converge_core::error::{Error, Result};
use converge_core::{
    ChangeHandler, ElementId, HandlerFilter, MetaModel, ObjectId, ObjectStore, Status,
    StoredObject,
};
use converge_storage::RetryConfig;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Unit of work for the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    /// An external object was written or deleted
    External(ObjectId),
    /// Process or re-evaluate one element
    Element(ElementId),
    /// Retry releasing the locks of an aborted Run
    Namespace(String),
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::External(id) => write!(f, "external {}", id),
            WorkKey::Element(id) => write!(f, "element {}", id),
            WorkKey::Namespace(ns) => write!(f, "namespace {}", ns),
        }
    }
}

/// Events observable through [`Engine::future`] and [`Engine::wait_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Status written with this value
    Status(Status),
    /// Any status write or removal
    Changed,
}

/// Engine counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Runs that locked their whole closure
    pub runs_granted: u64,
    /// Locking attempts that gave up
    pub runs_aborted: u64,
    /// Element outputs committed
    pub elements_committed: u64,
    /// Element targets rolled back
    pub elements_rolled_back: u64,
    /// Element phases removed
    pub elements_deleted: u64,
    /// Worker pool metrics
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) runs_granted: AtomicU64,
    pub(crate) runs_aborted: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) rolled_back: AtomicU64,
    pub(crate) deleted: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) retry: RetryConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) model: Arc<MetaModel>,
    pub(crate) registry: TypeRegistry,
    pub(crate) ns_locks: converge_concurrency::ElementLocks<String>,
    pub(crate) events: EventManager<ObjectId, Event>,
    pub(crate) queue: PoolHandle<WorkKey>,
    pub(crate) counters: Counters,
    pub(crate) releases: DashMap<String, PendingRelease>,
}

impl EngineInner {
    pub(crate) fn retry_later(&self, key: WorkKey) {
        self.queue.enqueue_after(key, self.config.retry_delay());
    }

    pub(crate) fn notify(&self, status: Option<Status>, id: &ObjectId) {
        if let Some(status) = status {
            self.events.trigger(&Event::Status(status), id);
        }
        self.events.trigger(&Event::Changed, id);
    }

    fn resync(&self) -> Result<()> {
        let ids = self.store.list_all()?;
        info!(target: "converge::engine", objects = ids.len(), "resync");
        for id in ids {
            if self.model.is_external(&id.type_name) {
                self.queue.enqueue(WorkKey::External(id));
            } else if self.model.is_internal(&id.type_name) {
                for t in self.model.triggering_types_for(&id.type_name) {
                    self.queue.enqueue(WorkKey::External(id.with_type(t)));
                }
                // Elements left locked by an interrupted Run.
                if let Ok(obj) = self.store.get_object(&id) {
                    if let Some(state) = obj.as_internal() {
                        for (phase, ps) in &state.phases {
                            if ps.is_locked() {
                                self.queue
                                    .enqueue(WorkKey::Element(id.element(phase.clone())));
                            }
                        }
                    }
                }
            } else if id.type_name == self.model.namespace_type() {
                self.queue.enqueue(WorkKey::Namespace(id.name));
            }
        }
        Ok(())
    }
}

impl Action<WorkKey> for EngineInner {
    fn reconcile(&self, ctx: &Context, key: &WorkKey) -> PoolStatus {
        if ctx.is_done() {
            return PoolStatus::Completed(None);
        }
        let result = match key {
            WorkKey::External(id) => self.reconcile_external(id),
            WorkKey::Element(id) => self.reconcile_element(id),
            WorkKey::Namespace(ns) => self.reconcile_namespace(ns),
        };
        match result {
            Ok(()) => PoolStatus::Completed(None),
            Err(e) if e.is_retryable() => {
                debug!(target: "converge::engine", key = %key, error = %e, "soft error, retrying later");
                self.retry_later(key.clone());
                PoolStatus::Completed(Some(e))
            }
            Err(e) => PoolStatus::Failed(e),
        }
    }

    fn command(&self, _ctx: &Context, cmd: &str) -> PoolStatus {
        match cmd {
            "resync" => match self.resync() {
                Ok(()) => PoolStatus::Completed(None),
                Err(e) => PoolStatus::Failed(e),
            },
            other => PoolStatus::Failed(Error::InvalidOperation(format!(
                "unknown command {}",
                other
            ))),
        }
    }
}

/// Queues external object changes
struct StoreListener {
    queue: PoolHandle<WorkKey>,
}

impl ChangeHandler for StoreListener {
    fn handle_change(&self, id: &ObjectId) {
        self.queue.enqueue(WorkKey::External(id.clone()));
    }
}

/// Run-based reconciliation engine
///
/// # Example
///
/// ```no_run
/// use converge_core::{ObjectId, ObjectStore};
/// use converge_engine::{testing, Engine, EngineConfig};
/// use converge_storage::MemoryStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
/// let engine = Engine::new(
///     EngineConfig::default(),
///     store,
///     testing::metamodel().unwrap(),
///     testing::registry().unwrap(),
/// )
/// .unwrap();
/// engine.start().unwrap();
/// engine.apply(ObjectId::new("Value", "ns", "A"), json!({"value": 5})).unwrap();
/// engine.shutdown();
/// ```
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
    pool: Pool<WorkKey>,
    started: AtomicBool,
}

impl Engine {
    /// Build an engine
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `UnknownType` if the registry
    /// does not match the metamodel.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        model: MetaModel,
        registry: TypeRegistry,
    ) -> Result<Self> {
        config.validate()?;
        registry.validate(&model)?;
        let pool = Pool::new("converge-worker");
        let inner = Arc::new(EngineInner {
            retry: config.retry(),
            config,
            store,
            model: Arc::new(model),
            registry,
            ns_locks: converge_concurrency::ElementLocks::new(),
            events: EventManager::new(),
            queue: pool.handle(),
            counters: Counters::default(),
            releases: DashMap::new(),
        });
        Ok(Self {
            inner,
            pool,
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to the store and spawn workers
    ///
    /// Calling `start` more than once is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let filter = HandlerFilter::types(self.inner.model.external_types());
        self.inner.store.register_handler(
            Arc::new(StoreListener {
                queue: self.pool.handle(),
            }),
            filter,
        );
        let action: Arc<dyn Action<WorkKey>> = self.inner.clone();
        self.pool.start(self.inner.config.workers, action)?;
        if self.inner.config.resync_on_start {
            self.pool.handle().command("resync");
        }
        info!(
            target: "converge::engine",
            model = self.inner.model.name(),
            workers = self.inner.config.workers,
            "engine started"
        );
        Ok(())
    }

    /// Stop workers; queued work is discarded
    pub fn shutdown(&self) {
        if !self.pool.handle().is_shutdown() {
            info!(target: "converge::engine", "engine shutting down");
        }
        self.pool.shutdown();
    }

    /// Block until the pool has nothing queued, delayed or running
    pub fn drain(&self) {
        self.pool.drain();
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    /// Metamodel
    pub fn model(&self) -> &MetaModel {
        &self.inner.model
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Create an external object or replace its spec
    ///
    /// # Errors
    ///
    /// `UnknownType` if `id` is not an external type of the metamodel.
    pub fn apply(&self, id: ObjectId, spec: Value) -> Result<StoredObject> {
        if !self.inner.model.is_external(&id.type_name) {
            return Err(Error::UnknownType(id.type_name));
        }
        self.inner.apply_external(id, spec)
    }

    /// Delete an external object
    pub fn delete(&self, id: &ObjectId) -> Result<()> {
        self.inner.store.delete_object(id)
    }

    /// Future fired whenever `id` gets `status` written
    pub fn future(&self, status: Status, id: &ObjectId) -> Arc<Future> {
        self.inner.events.future(Event::Status(status), id.clone())
    }

    /// Block until `pred` holds for the stored `id`
    ///
    /// `pred` sees `None` while the object does not exist. Returns `false`
    /// if `ctx` is done first.
    pub fn wait_for<F>(&self, ctx: &Context, id: &ObjectId, mut pred: F) -> bool
    where
        F: FnMut(Option<&StoredObject>) -> bool,
    {
        // Register before the first check so no write slips between them.
        let changed = self.inner.events.future(Event::Changed, id.clone());
        loop {
            let current = self.inner.store.get_object(id).ok();
            if pred(current.as_ref()) {
                return true;
            }
            if !changed.wait(ctx) {
                warn!(target: "converge::engine", object = %id, "wait gave up");
                return false;
            }
        }
    }

    /// Block until the external object `id` reports `status`
    pub fn wait_status(&self, ctx: &Context, id: &ObjectId, status: Status) -> bool {
        self.wait_for(ctx, id, |obj| {
            obj.and_then(|o| o.as_external())
                .map_or(false, |e| e.status.status == status)
        })
    }

    /// Counters snapshot
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            runs_granted: c.runs_granted.load(Ordering::Relaxed),
            runs_aborted: c.runs_aborted.load(Ordering::Relaxed),
            elements_committed: c.committed.load(Ordering::Relaxed),
            elements_rolled_back: c.rolled_back.load(Ordering::Relaxed),
            elements_deleted: c.deleted.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
