//! Reconciliation engine for converge
//!
//! This crate drives internal elements towards the specs of the external
//! objects that trigger them:
//! - EngineConfig: tunables loaded from `converge.toml`
//! - InternalPhase / TypeRegistry: the contract internal types implement
//! - Element / NamespaceView: runtime views rebuilt from stored objects
//! - Locking: all-or-nothing Run acquisition over a dependency closure
//! - Reconcile: the per-element state machine (target, process, commit)
//! - Engine: store subscription, worker pool and observation API
//!
//! The engine is the only component that knows about:
//! - Runs and their lock lifecycle
//! - Formal versions of element inputs
//! - Status write-back into external objects

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod element;
pub mod engine;
mod locking;
pub mod phase;
mod reconcile;
pub mod registry;
pub mod testing;

pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use element::{Element, NamespaceView};
pub use engine::{Engine, EngineStats, Event, WorkKey};
pub use phase::{Acceptance, InternalPhase, ProcessRequest, ProcessResult, SlaveChanges};
pub use registry::TypeRegistry;
