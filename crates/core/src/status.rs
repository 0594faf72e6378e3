//! Status values exposed on external and internal objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reconciliation status of an element or external object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    /// Never processed
    #[default]
    Initial,
    /// Locked by a Run, not yet picked up
    Pending,
    /// Target state being prepared
    Preparing,
    /// Process is running
    Processing,
    /// Inputs not yet committed; stays locked and is re-queued
    Waiting,
    /// Output committed
    Completed,
    /// Process failed; lock rolled back
    Failed,
    /// A dependency is missing or unusable; lock rolled back
    Blocked,
    /// Element removed
    Deleted,
    /// External spec rejected as invalid
    Invalid,
}

impl Status {
    /// All status values, in declaration order
    pub const ALL: [Status; 10] = [
        Status::Initial,
        Status::Pending,
        Status::Preparing,
        Status::Processing,
        Status::Waiting,
        Status::Completed,
        Status::Failed,
        Status::Blocked,
        Status::Deleted,
        Status::Invalid,
    ];

    /// Name as used in persisted status fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initial => "Initial",
            Status::Pending => "Pending",
            Status::Preparing => "Preparing",
            Status::Processing => "Processing",
            Status::Waiting => "Waiting",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Blocked => "Blocked",
            Status::Deleted => "Deleted",
            Status::Invalid => "Invalid",
        }
    }

    /// Parse a persisted status name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    /// Status after which no further work happens until the next change
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Blocked | Status::Deleted | Status::Invalid
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
