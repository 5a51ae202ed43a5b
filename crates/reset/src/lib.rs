//! OYA Reset - workflow reset for the history service.
//!
//! Resetting a workflow creates a new run whose history is the base run's
//! history up to a chosen event, then moves the workflow onto that run:
//!
//! 1. Fork the base branch after the reset point and replay the prefix.
//! 2. Fail the decision and activities that were in flight at that point.
//! 3. Reapply signals received after it, following continue-as-new
//!    successors up to the current run.
//! 4. Optionally terminate the current run.
//! 5. Commit with optimistic preconditions on the current run.
//!
//! # Architecture
//!
//! - **State**: the [`MutableState`] seam and its in-memory
//!   [`WorkflowMutableState`].
//! - **Context**: [`RunContext`] persistence, [`RunLock`], [`RunHandle`] and
//!   the [`RunCache`] that shares them.
//! - **Reset**: [`WorkflowResetter`] driving [`StateRebuilder`],
//!   [`EventReapplier`] and [`PersistenceCoordinator`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod context;
pub mod error;
pub mod execution_store;
pub mod mutable_state;
pub mod persistence;
pub mod reapplier;
pub mod rebuilder;
pub mod resetter;
pub mod state;

pub use cache::{ExecutionCache, RunCache};
pub use context::{
    ContextError, CreateMode, ExecutionContext, RunContext, RunGuard, RunHandle, RunLock,
};
pub use error::{Error, Result};
pub use execution_store::{
    CreateExecutionRequest, CurrentExecution, ExecutionStore, InMemoryExecutionStore,
    UpdateWithNewRequest,
};
pub use mutable_state::WorkflowMutableState;
pub use persistence::PersistenceCoordinator;
pub use reapplier::{EventReapplier, ReapplySource};
pub use rebuilder::{HistoryReplayRebuilder, RebuildRequest, StateRebuilder};
pub use resetter::{ResetRequest, WorkflowResetter};
pub use state::{
    ActivityFailure, ActivityInfo, DecisionFailure, DecisionInfo, ExecutionInfo, ExecutionStatus,
    MutableState, StateError, TransactionPolicy, WorkflowEvents, WorkflowSnapshot,
};
