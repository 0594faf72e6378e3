//! Error types for converge
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! The variants fall into the classes the engine treats differently:
//! model errors are fatal at startup, optimistic-concurrency errors are soft
//! and resolved by level-triggered re-evaluation, and cancellation at a
//! blocking wait is an ordinary outcome.

use crate::types::ObjectId;
use thiserror::Error;

/// Result type alias for converge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a cancellable context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Explicitly cancelled
    #[error("context canceled")]
    Canceled,
    /// Watchdog duration elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Error types for the reconciliation engine
#[derive(Debug, Error)]
pub enum Error {
    /// The metamodel specification is inconsistent
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A dependency cycle was found while walking a graph
    #[error("dependency cycle: {}", path.join("->"))]
    DependencyCycle {
        /// Node names in traversal order, first node repeated at the end
        path: Vec<String>,
    },

    /// Optimistic write lost against a concurrent modification
    #[error("object {0} outdated")]
    Outdated(ObjectId),

    /// Object not found
    #[error("object {0} does not exist")]
    NotExist(ObjectId),

    /// Object already present on create
    #[error("object {0} already exists")]
    AlreadyExists(ObjectId),

    /// Malformed formal version text
    #[error("syntax error at offset {offset}: found {found}, expected {expected}")]
    Syntax {
        /// Offending character, or "end of input"
        found: String,
        /// Byte offset into the input
        offset: usize,
        /// What the parser was looking for
        expected: String,
    },

    /// A versioned entry references a node absent from the graph
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// Type name not known to the metamodel or registry
    #[error("unknown type {0}")]
    UnknownType(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration could not be read or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking wait was cancelled or timed out
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl Error {
    /// Build a syntax error for the character at `offset` in `input`
    pub fn syntax(input: &str, offset: usize, expected: impl Into<String>) -> Self {
        let found = match input[offset..].chars().next() {
            Some(c) => format!("'{}'", c),
            None => "end of input".to_string(),
        };
        Error::Syntax {
            found,
            offset,
            expected: expected.into(),
        }
    }

    /// True for a lost compare-and-set
    pub fn is_outdated(&self) -> bool {
        matches!(self, Error::Outdated(_))
    }

    /// True if the addressed object is absent
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist(_))
    }

    /// Soft errors that are resolved by re-evaluating later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Outdated(_) | Error::AlreadyExists(_))
    }

    /// Model and configuration errors that must stop startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidModel(_)
                | Error::DependencyCycle { .. }
                | Error::UnknownType(_)
                | Error::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
