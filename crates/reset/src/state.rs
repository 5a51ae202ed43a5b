//! Mutable-state contract and the records it produces.
//!
//! A [`MutableState`] is the replay-derived view of one run: execution info,
//! pending activities, the current decision, buffered events and the next
//! event ID. Every `add_*` operation appends an event to the open transaction;
//! [`MutableState::close_transaction_as_snapshot`] hands the transaction over
//! for persistence.

use chrono::{DateTime, Utc};
use oya_core::{RunId, WorkflowIdentifier, EMPTY_EVENT_ID};
use oya_history::{BranchToken, DecisionTaskFailedCause, HistoryEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure inside a mutable-state operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("mutable state operation '{operation}' failed: {reason}")]
pub struct StateError {
    pub operation: String,
    pub reason: String,
}

impl StateError {
    /// Create a state error for an operation.
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

/// Static and lifecycle information about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub identifier: WorkflowIdentifier,
    pub workflow_type: String,
    pub task_list: String,
    pub status: ExecutionStatus,
    /// Request that created the run; a reset run carries the reset request ID.
    pub create_request_id: String,
    pub continued_execution_run_id: Option<RunId>,
    pub signal_count: i64,
    /// First event ID of the batch holding the close event.
    pub completion_event_batch_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl ExecutionInfo {
    /// Execution info for a run whose start event has not been applied yet.
    pub fn new(identifier: WorkflowIdentifier, create_request_id: impl Into<String>) -> Self {
        Self {
            identifier,
            workflow_type: String::new(),
            task_list: String::new(),
            status: ExecutionStatus::Running,
            create_request_id: create_request_id.into(),
            continued_execution_run_id: None,
            signal_count: 0,
            completion_event_batch_id: None,
            start_time: None,
            last_update_time: None,
        }
    }
}

/// A scheduled activity that has not completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub schedule_id: i64,
    /// `EMPTY_EVENT_ID` until started.
    pub started_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub attempt: i32,
    /// Last heartbeat details.
    pub details: Option<Vec<u8>>,
    pub started_identity: Option<String>,
}

impl ActivityInfo {
    /// Whether a worker picked the activity up.
    pub fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

/// The current decision task of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub version: i64,
    pub schedule_id: i64,
    /// `EMPTY_EVENT_ID` until started.
    pub started_id: i64,
    pub attempt: i64,
}

impl DecisionInfo {
    /// A decision is in flight once a worker started it.
    pub fn is_in_flight(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

/// Fields of an ActivityTaskFailed event.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFailure {
    pub schedule_id: i64,
    pub started_id: i64,
    pub reason: String,
    pub details: Option<Vec<u8>>,
    pub identity: Option<String>,
}

/// Fields of a DecisionTaskFailed event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionFailure {
    pub cause: DecisionTaskFailedCause,
    pub details: Option<Vec<u8>>,
    pub identity: String,
    pub reason: String,
    pub base_run_id: Option<RunId>,
    pub new_run_id: Option<RunId>,
    pub fork_event_version: i64,
}

impl DecisionFailure {
    /// Failure recorded when the service force-closes a decision.
    pub fn force_close(identity: impl Into<String>) -> Self {
        Self {
            cause: DecisionTaskFailedCause::ForceCloseDecision,
            details: None,
            identity: identity.into(),
            reason: String::new(),
            base_run_id: None,
            new_run_id: None,
            fork_event_version: 0,
        }
    }

    /// Failure recorded on the reset run for the decision at the reset point.
    pub fn reset(
        identity: impl Into<String>,
        reason: impl Into<String>,
        base_run_id: RunId,
        new_run_id: RunId,
        fork_event_version: i64,
    ) -> Self {
        Self {
            cause: DecisionTaskFailedCause::ResetWorkflow,
            details: None,
            identity: identity.into(),
            reason: reason.into(),
            base_run_id: Some(base_run_id),
            new_run_id: Some(new_run_id),
            fork_event_version,
        }
    }
}

/// How a transaction is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// Local writes: buffered events are flushed when no decision is in flight.
    Active,
    /// Replicated writes: buffered events stay buffered.
    Passive,
}

/// Persisted form of a mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: ExecutionInfo,
    pub next_event_id: i64,
    pub last_write_version: i64,
    pub current_version: i64,
    pub branch_token: BranchToken,
    pub pending_activities: Vec<ActivityInfo>,
    pub decision: Option<DecisionInfo>,
    pub buffered_events: Vec<HistoryEvent>,
}

/// One ordered batch of new events for a run's branch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvents {
    pub identifier: WorkflowIdentifier,
    pub branch_token: BranchToken,
    pub events: Vec<HistoryEvent>,
}

/// Operations the reset flow performs on a run's mutable state.
pub trait MutableState: Send + Sync + std::fmt::Debug {
    /// Static and lifecycle information.
    fn execution_info(&self) -> &ExecutionInfo;

    /// Version of the last persisted write.
    fn last_write_version(&self) -> i64;

    /// Version stamped on newly added events.
    fn current_version(&self) -> i64;

    /// ID the next added event will receive.
    fn next_event_id(&self) -> i64;

    /// Branch the run's history is written to.
    fn current_branch_token(&self) -> &BranchToken;

    fn is_running(&self) -> bool;

    /// Pending activities ordered by schedule ID.
    fn pending_activities(&self) -> Vec<ActivityInfo>;

    /// The started, not yet closed decision, if any.
    fn in_flight_decision(&self) -> Option<DecisionInfo>;

    /// Whether a decision is scheduled or started.
    fn has_pending_decision(&self) -> bool;

    fn add_activity_failed(&mut self, failure: ActivityFailure)
        -> Result<HistoryEvent, StateError>;

    fn add_decision_failed(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        failure: DecisionFailure,
    ) -> Result<HistoryEvent, StateError>;

    fn add_decision_scheduled(&mut self) -> Result<DecisionInfo, StateError>;

    /// Assign event IDs to buffered events and move them into the transaction.
    fn flush_buffered_events(&mut self) -> Result<(), StateError>;

    /// Append WorkflowExecutionTerminated; `first_event_id` is recorded as
    /// the completion event's batch ID.
    fn add_workflow_terminated(
        &mut self,
        first_event_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<HistoryEvent, StateError>;

    /// Record a signal; buffered while a decision is in flight.
    fn add_workflow_signaled(
        &mut self,
        signal_name: &str,
        input: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<HistoryEvent, StateError>;

    /// Close the open transaction into a snapshot and its new event batches.
    fn close_transaction_as_snapshot(
        &mut self,
        now: DateTime<Utc>,
        policy: TransactionPolicy,
    ) -> Result<(WorkflowSnapshot, Vec<WorkflowEvents>), StateError>;
}
