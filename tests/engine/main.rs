//! Engine Integration Tests
//!
//! End-to-end reconciliation over the calculator demo model: values,
//! operators, dependency ordering, deletion and engine lifecycle.

#[path = "../common/mod.rs"]
mod common;

mod deletion;
mod lifecycle;
mod operators;
mod values;
