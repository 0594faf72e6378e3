//! Storage layer for converge
//!
//! This crate implements the object store backing the engine:
//! - MemoryStore: DashMap of per-namespace FxHashMap shards
//! - Version management with a store-wide AtomicU64
//! - Change notification to registered handlers
//! - `modify`: compare-and-set read-modify-write with backoff

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod retry;

pub use memory::{MemoryStore, Shard};
pub use retry::{modify, RetryConfig};
