//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::{Arc, Once};
use std::time::Duration;

pub use converge::{
    testing, Context, Engine, EngineConfig, Error, ExternalStatus, MemoryStore, ObjectData,
    ObjectId, ObjectStore, RunId, Status, StoredObject,
};
pub use serde_json::{json, Value};

/// Namespace used by the engine suites
pub const NS: &str = "calc";

/// Upper bound for any single wait
pub const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Short retry delay so contention resolves quickly in tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 4,
        retry_delay_ms: 2,
        ..EngineConfig::default()
    }
}

/// Context that gives up after [`TIMEOUT`].
pub fn ctx() -> Context {
    Context::background().with_timeout(TIMEOUT)
}

// ============================================================================
// TestEngine - demo engine over its own store
// ============================================================================

/// Started demo engine with helpers for the calculator types.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<dyn ObjectStore>,
}

impl TestEngine {
    /// Engine with [`fast_config`] over a fresh store.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Engine with `config` over a fresh store.
    pub fn with_config(config: EngineConfig) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        Self::on_store(config, store)
    }

    /// Engine with `config` over an existing store.
    pub fn on_store(config: EngineConfig, store: Arc<dyn ObjectStore>) -> Self {
        init_tracing();
        let engine = Engine::new(
            config,
            Arc::clone(&store),
            testing::metamodel().unwrap(),
            testing::registry().unwrap(),
        )
        .unwrap();
        engine.start().unwrap();
        Self { engine, store }
    }

    pub fn value_id(name: &str) -> ObjectId {
        ObjectId::new(testing::VALUE, NS, name)
    }

    pub fn operator_id(name: &str) -> ObjectId {
        ObjectId::new(testing::OPERATOR, NS, name)
    }

    /// Create or update value `name`.
    pub fn value(&self, name: &str, value: i64) -> ObjectId {
        let id = Self::value_id(name);
        self.engine.apply(id.clone(), json!({ "value": value })).unwrap();
        id
    }

    /// Create or update operator `name`.
    pub fn operator(&self, name: &str, operator: &str, operands: &[&str]) -> ObjectId {
        self.operator_spec(name, json!({ "operator": operator, "operands": operands }))
    }

    /// Create or update operator `name` with a raw spec.
    pub fn operator_spec(&self, name: &str, spec: Value) -> ObjectId {
        let id = Self::operator_id(name);
        self.engine.apply(id.clone(), spec).unwrap();
        id
    }

    /// Delete an external object.
    pub fn delete(&self, id: &ObjectId) {
        self.engine.delete(id).unwrap();
    }

    /// Status block of an external object, default if absent.
    pub fn status(&self, id: &ObjectId) -> ExternalStatus {
        self.store
            .get_object(id)
            .ok()
            .and_then(|o| o.as_external().map(|e| e.status.clone()))
            .unwrap_or_default()
    }

    /// Wait for `Completed` with the given result.
    pub fn wait_result(&self, id: &ObjectId, expected: Value) {
        let reached = self.engine.wait_for(&ctx(), id, |o| {
            o.and_then(|o| o.as_external()).map_or(false, |e| {
                e.status.status == Status::Completed && e.status.result.as_ref() == Some(&expected)
            })
        });
        assert!(
            reached,
            "{} never completed with {} (last status {:?})",
            id,
            expected,
            self.status(id)
        );
    }

    /// Wait for an external status.
    pub fn wait_status(&self, id: &ObjectId, status: Status) {
        let reached = self.engine.wait_status(&ctx(), id, status);
        assert!(
            reached,
            "{} never reached {} (last status {:?})",
            id,
            status,
            self.status(id)
        );
    }

    /// Wait until the object no longer exists.
    pub fn wait_gone(&self, id: &ObjectId) {
        let gone = self.engine.wait_for(&ctx(), id, |o| o.is_none());
        assert!(gone, "{} still exists", id);
    }

    /// Ids of every internal object in [`NS`].
    pub fn internal_objects(&self) -> Vec<ObjectId> {
        self.store
            .list_namespace(NS)
            .unwrap()
            .into_iter()
            .filter(|o| matches!(o.data, ObjectData::Internal(_)))
            .map(|o| o.id)
            .collect()
    }

    /// Persisted run lock of [`NS`].
    pub fn namespace_lock(&self) -> Option<RunId> {
        let id = ObjectId::new(testing::NAMESPACE, "", NS);
        self.store
            .get_object(&id)
            .ok()
            .and_then(|o| o.as_namespace().and_then(|n| n.run_lock))
    }

    /// Wait until the pool has no queued, delayed or running work.
    pub fn settle(&self) {
        self.engine.drain();
    }
}
