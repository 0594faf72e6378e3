//! Concurrency primitives for converge
//!
//! This crate provides the blocking building blocks of the engine:
//! - Context: cancellation and watchdog deadlines for blocking calls
//! - ElementLocks / Mutex: per-key mutual exclusion with FIFO handoff
//! - Future / EventManager: trigger and wait rendezvous keyed by event
//! - Pool: keyed worker pool with per-key serialization
//!
//! All blocking happens on parking_lot condvars and every wait honors a
//! [`Context`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod future;
pub mod keyed_mutex;
pub mod pool;

pub use context::{Context, WakerGuard};
pub use future::{EventManager, Future};
pub use keyed_mutex::{ElementLocks, KeyGuard, Mutex};
pub use pool::{Action, Pool, PoolHandle, PoolStats, Status};
