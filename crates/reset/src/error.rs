//! Error types for the reset crate.

use oya_core::{Cancelled, RunId};
use thiserror::Error;

/// Result type alias for reset operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reset error types.
///
/// Each variant names the reset step that failed. Nothing is retried
/// internally; see [`Error::is_retryable`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The history store refused to fork the base branch.
    #[error("failed to fork history for reset run {run_id}: {source}")]
    BranchFork {
        run_id: RunId,
        #[source]
        source: oya_history::Error,
    },

    /// Rebuilding the reset run's state from history failed.
    #[error("failed to replay history into reset run {run_id}: {reason}")]
    Replay { run_id: RunId, reason: String },

    /// Failing a pending activity failed; remaining activities were skipped.
    #[error("failed to fail activity scheduled at event {schedule_id}: {reason}")]
    ActivityFailureApply { schedule_id: i64, reason: String },

    /// Force-failing an in-flight decision or flushing buffered events failed.
    #[error("failed to force-close decision of run {run_id}: {reason}")]
    DecisionForceClose { run_id: RunId, reason: String },

    /// Appending the terminated event to the current run failed.
    #[error("failed to terminate run {run_id}: {reason}")]
    TerminationAppend { run_id: RunId, reason: String },

    /// The current run changed underneath the reset.
    #[error("persistence precondition failed for run {run_id}: {reason}")]
    PersistenceConflict { run_id: RunId, reason: String },

    /// Any other storage failure while committing the reset run.
    #[error("failed to persist reset run {run_id}: {reason}")]
    Persistence { run_id: RunId, reason: String },

    /// Reading history while reapplying events onto `run_id` failed.
    #[error("failed to read history while reapplying onto run {run_id}: {source}")]
    PaginationRead {
        run_id: RunId,
        #[source]
        source: oya_history::Error,
    },

    /// A continue-as-new successor could not be loaded.
    #[error("failed to look up successor run {run_id}: {reason}")]
    SuccessorLookup { run_id: RunId, reason: String },

    /// Re-adding an event to the target run failed.
    #[error("failed to reapply events onto run {run_id}: {reason}")]
    EventReapply { run_id: RunId, reason: String },

    /// The reset observed a cancellation request.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    /// Create a branch fork error, surfacing cancellation as [`Error::Cancelled`].
    pub fn branch_fork(run_id: RunId, source: oya_history::Error) -> Self {
        match source {
            oya_history::Error::Cancelled(cancelled) => Self::Cancelled(cancelled),
            source => Self::BranchFork { run_id, source },
        }
    }

    /// Create a pagination read error, surfacing cancellation as [`Error::Cancelled`].
    pub fn pagination_read(run_id: RunId, source: oya_history::Error) -> Self {
        match source {
            oya_history::Error::Cancelled(cancelled) => Self::Cancelled(cancelled),
            source => Self::PaginationRead { run_id, source },
        }
    }

    /// Create a replay error.
    pub fn replay(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::Replay {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create an activity failure apply error.
    pub fn activity_failure_apply(schedule_id: i64, reason: impl Into<String>) -> Self {
        Self::ActivityFailureApply {
            schedule_id,
            reason: reason.into(),
        }
    }

    /// Create a decision force-close error.
    pub fn decision_force_close(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::DecisionForceClose {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create a termination append error.
    pub fn termination_append(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::TerminationAppend {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create a persistence conflict error.
    pub fn persistence_conflict(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::PersistenceConflict {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::Persistence {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create a successor lookup error.
    pub fn successor_lookup(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::SuccessorLookup {
            run_id,
            reason: reason.into(),
        }
    }

    /// Create an event reapply error.
    pub fn event_reapply(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::EventReapply {
            run_id,
            reason: reason.into(),
        }
    }

    /// Whether a brand-new reset attempt may succeed where this one failed.
    ///
    /// Each attempt forks a fresh branch under a fresh run ID, so retrying
    /// after a conflict or a failed read is safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PersistenceConflict { .. } => true,
            Self::PaginationRead { source, .. } => {
                matches!(source, oya_history::Error::ReadFailed { .. })
            }
            _ => false,
        }
    }

    /// Whether the reset stopped because of a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::persistence_conflict(RunId::new("r1"), "current run moved");
        assert_eq!(
            err.to_string(),
            "persistence precondition failed for run r1: current run moved"
        );
    }

    #[test]
    fn conflicts_and_read_failures_are_retryable() {
        assert!(Error::persistence_conflict(RunId::new("r"), "x").is_retryable());
        assert!(Error::pagination_read(
            RunId::new("r"),
            oya_history::Error::read_failed("io")
        )
        .is_retryable());
        assert!(!Error::replay(RunId::new("r"), "x").is_retryable());
        assert!(!Error::branch_fork(
            RunId::new("r"),
            oya_history::Error::duplicate_gc_info("ns:wf:r")
        )
        .is_retryable());
    }

    #[test]
    fn history_cancellation_surfaces_as_cancelled() {
        let err = Error::pagination_read(
            RunId::new("r"),
            oya_history::Error::Cancelled(Cancelled::new("read_history_branch")),
        );
        assert!(err.is_cancelled());

        let err = Error::branch_fork(
            RunId::new("r"),
            oya_history::Error::Cancelled(Cancelled::new("fork_branch")),
        );
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }
}
