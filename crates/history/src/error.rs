//! Error types for the history crate.

use oya_core::Cancelled;
use thiserror::Error;

/// Result type alias for history operations.
pub type Result<T> = std::result::Result<T, Error>;

/// History store and pagination errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The referenced branch does not exist.
    #[error("history branch '{branch}' not found")]
    BranchNotFound { branch: String },

    /// A branch already carries this garbage-collection key.
    #[error("history branch with gc info '{info}' already exists")]
    DuplicateGcInfo { info: String },

    /// Fork node lies outside the base branch.
    #[error("invalid fork node {node_id}: {reason}")]
    InvalidForkPoint { node_id: i64, reason: String },

    /// Appended events break the gapless ordering of the branch.
    #[error("history append rejected: {reason}")]
    AppendRejected { reason: String },

    /// Read range is empty or malformed.
    #[error("invalid event range [{min_event_id}, {max_event_id})")]
    InvalidRange { min_event_id: i64, max_event_id: i64 },

    /// Continuation token was not issued by this store.
    #[error("invalid page token: {reason}")]
    InvalidPageToken { reason: String },

    /// Backend read failed.
    #[error("history read failed: {reason}")]
    ReadFailed { reason: String },

    /// `next` was called on a drained iterator.
    #[error("paging iterator exhausted")]
    Exhausted,

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Operation observed a cancellation request.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    /// Create a branch not found error.
    pub fn branch_not_found(branch: impl Into<String>) -> Self {
        Self::BranchNotFound {
            branch: branch.into(),
        }
    }

    /// Create a duplicate gc info error.
    pub fn duplicate_gc_info(info: impl Into<String>) -> Self {
        Self::DuplicateGcInfo { info: info.into() }
    }

    /// Create an invalid fork point error.
    pub fn invalid_fork_point(node_id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidForkPoint {
            node_id,
            reason: reason.into(),
        }
    }

    /// Create an append rejected error.
    pub fn append_rejected(reason: impl Into<String>) -> Self {
        Self::AppendRejected {
            reason: reason.into(),
        }
    }

    /// Create an invalid page token error.
    pub fn invalid_page_token(reason: impl Into<String>) -> Self {
        Self::InvalidPageToken {
            reason: reason.into(),
        }
    }

    /// Create a read failed error.
    pub fn read_failed(reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether the failure came from a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_fork_point(12, "beyond branch end");
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("beyond branch end"));

        let err = Error::InvalidRange {
            min_event_id: 5,
            max_event_id: 5,
        };
        assert_eq!(err.to_string(), "invalid event range [5, 5)");
    }

    #[test]
    fn test_cancelled_conversion() {
        let err: Error = Cancelled::new("read_history_branch").into();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("read_history_branch"));
    }
}
