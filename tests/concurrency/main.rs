//! Concurrency Integration Tests
//!
//! Multi-threaded behavior of the blocking primitives, the worker pool
//! and the store's compare-and-set.

#[path = "../common/mod.rs"]
mod common;

mod events;
mod keyed_mutex;
mod pool;
mod store_cas;
