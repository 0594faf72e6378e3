//! Converge - run-based graph locking and phase reconciliation
//!
//! Converge keeps engine-owned internal objects in step with user-authored
//! external objects. Every internal object is split into phases; a change
//! to an external object starts a Run that locks the affected element and
//! everything depending on it, then processes each element once its inputs
//! are committed.
//!
//! # Quick Start
//!
//! ```no_run
//! use converge::{testing, Context, EngineConfig, ObjectId, Status};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let engine = testing::engine(EngineConfig::default())?;
//! engine.start()?;
//!
//! let a = ObjectId::new("Value", "demo", "A");
//! engine.apply(a.clone(), json!({"value": 5}))?;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! assert!(engine.wait_status(&ctx, &a, Status::Completed));
//! # Ok::<(), converge::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `converge-core`: ids, object model, metamodel, formal versions
//! - `converge-storage`: the in-memory object store and CAS helpers
//! - `converge-concurrency`: contexts, keyed mutexes, futures, worker pool
//! - `converge-engine`: locking protocol, phase state machine, `Engine`

pub use converge_concurrency::{Context, ElementLocks, EventManager, Future, Mutex, Pool};
pub use converge_core::{
    ElementId, Error, ExternalState, ExternalStatus, MetaModel, MetaModelSpec, NamespaceState,
    ObjectData, ObjectId, ObjectStore, PhaseSpec, Result, RunId, Status, StoredObject, TypeId,
};
pub use converge_engine::{
    testing, Acceptance, Engine, EngineConfig, EngineStats, InternalPhase, ProcessRequest,
    ProcessResult, SlaveChanges, TypeRegistry, CONFIG_FILE_NAME,
};
pub use converge_storage::{MemoryStore, RetryConfig};
