//! Core types for converge
//!
//! This crate defines the foundational types used throughout the system:
//! - RunId, ObjectId, ElementId, TypeId: identifiers
//! - Status: reconciliation status values
//! - Object data model: namespace lock, external specs, per-phase state
//! - MetaModel: validated description of types, phases and dependencies
//! - Formal versions: version graph composition and its text form parser
//! - Traits: ObjectStore and ChangeHandler
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dag;
pub mod error;
pub mod metamodel;
pub mod object;
pub mod status;
pub mod traits;
pub mod types;
pub mod version;

pub use error::{ContextError, Error, Result};
pub use metamodel::{MetaModel, MetaModelSpec, PhaseSpec};
pub use object::{
    content_version, CommitInfo, CurrentState, ExternalState, ExternalStatus, InternalState,
    NamespaceState, ObjectData, PhaseState, PriorStatus, StoredObject, TargetState,
};
pub use status::Status;
pub use traits::{ChangeHandler, HandlerFilter, ObjectStore};
pub use types::{ElementId, ObjectId, RunId, TypeId};
pub use version::{
    generated_name, parse, sha256_hex, Composer, Graph, HashedComposer, Node, NodeId,
    TextComposer,
};
