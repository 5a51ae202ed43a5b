//! Per-run execution context, run lock and locked run handle.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oya_core::{CancelSignal, Cancelled, RunId, WorkflowIdentifier, EMPTY_EVENT_ID};
use oya_history::{AppendHistoryNodesRequest, HistoryStore};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::execution_store::{CreateExecutionRequest, ExecutionStore, UpdateWithNewRequest};
use crate::mutable_state::WorkflowMutableState;
use crate::state::{MutableState, StateError, TransactionPolicy, WorkflowEvents, WorkflowSnapshot};

/// Execution context and execution store errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    /// An optimistic-concurrency precondition did not hold.
    #[error("condition failed: {reason}")]
    Conflict { reason: String },

    #[error("workflow execution '{identifier}' not found")]
    NotFound { identifier: String },

    #[error("execution store failure: {reason}")]
    Failed { reason: String },

    #[error(transparent)]
    History(#[from] oya_history::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ContextError {
    /// Create a conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(identifier: &WorkflowIdentifier) -> Self {
        Self::NotFound {
            identifier: identifier.to_string(),
        }
    }

    /// Create a generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// How a run record is created relative to the workflow's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// The workflow has no current run.
    BrandNew,
    /// The new run supersedes the current run, which must match the given
    /// run ID and last write version.
    ContinueAsNew,
}

/// Mutual exclusion for one run. Cloning shares the lock.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    inner: Arc<Mutex<()>>,
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock unless cancellation is requested first.
    pub async fn acquire(&self, cancel: &CancelSignal) -> Result<RunGuard, Cancelled> {
        cancel.check("acquire_run_lock")?;
        tokio::select! {
            guard = Arc::clone(&self.inner).lock_owned() => Ok(RunGuard { _guard: guard }),
            () = cancel.cancelled() => Err(Cancelled::new("acquire_run_lock")),
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| RunGuard { _guard: guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Everything the reset flow needs from a run's execution context.
#[async_trait]
pub trait RunContext: Send + Sync {
    fn identifier(&self) -> &WorkflowIdentifier;

    fn run_lock(&self) -> &RunLock;

    /// Load the run's mutable state. Callers hold the run lock.
    async fn load(&self) -> Result<Box<dyn MutableState>, ContextError>;

    /// Append a run's first event batch to its branch; returns the batch size.
    /// The recorded history size is left to the caller.
    async fn persist_first_event_batch(&self, events: &WorkflowEvents) -> Result<i64, ContextError>;

    /// Create the run record, conditioned per `mode`. `events_size` is the
    /// size of the run's first event batch; it is added to the recorded
    /// history size.
    async fn create_workflow_execution(
        &self,
        now: DateTime<Utc>,
        mode: CreateMode,
        prev_run_id: Option<RunId>,
        prev_last_write_version: i64,
        snapshot: WorkflowSnapshot,
        events_size: i64,
    ) -> Result<(), ContextError>;

    /// Atomically commit this run's open transaction and install `new_state`
    /// as the workflow's current run.
    async fn update_with_new_as_active(
        &self,
        now: DateTime<Utc>,
        this_state: &mut dyn MutableState,
        new_context: &dyn RunContext,
        new_state: &mut dyn MutableState,
    ) -> Result<(), ContextError>;

    /// Bytes of history written for the run.
    fn history_size(&self) -> i64;

    fn set_history_size(&self, size: i64);
}

/// A run's context, its loaded state and its held lock.
///
/// The lock is released exactly once: by [`RunHandle::release`] or when the
/// handle is dropped on an error path.
pub struct RunHandle {
    context: Arc<dyn RunContext>,
    state: Box<dyn MutableState>,
    _guard: RunGuard,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("identifier", self.context.identifier())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn new(context: Arc<dyn RunContext>, state: Box<dyn MutableState>, guard: RunGuard) -> Self {
        Self {
            context,
            state,
            _guard: guard,
        }
    }

    /// Acquire the context's lock, then load its state.
    pub async fn lock_and_load(
        context: Arc<dyn RunContext>,
        cancel: &CancelSignal,
    ) -> Result<Self, ContextError> {
        let guard = context.run_lock().acquire(cancel).await?;
        let state = context.load().await?;
        Ok(Self::new(context, state, guard))
    }

    pub fn identifier(&self) -> &WorkflowIdentifier {
        self.context.identifier()
    }

    pub fn context(&self) -> &Arc<dyn RunContext> {
        &self.context
    }

    pub fn state(&self) -> &dyn MutableState {
        self.state.as_ref()
    }

    pub fn state_mut(&mut self) -> &mut dyn MutableState {
        self.state.as_mut()
    }

    /// Context and mutable state borrowed together.
    pub fn parts_mut(&mut self) -> (&dyn RunContext, &mut dyn MutableState) {
        (self.context.as_ref(), self.state.as_mut())
    }

    /// Release the run lock.
    pub fn release(self) {
        tracing::trace!(run = %self.context.identifier(), "Releasing run lock");
    }
}

/// [`RunContext`] over an [`ExecutionStore`] and a [`HistoryStore`].
pub struct ExecutionContext {
    identifier: WorkflowIdentifier,
    shard_id: i32,
    executions: Arc<dyn ExecutionStore>,
    history: Arc<dyn HistoryStore>,
    lock: RunLock,
    history_size: AtomicI64,
    /// Next event ID observed at load; gates `update_with_new_as_active`.
    condition: AtomicI64,
}

impl ExecutionContext {
    pub fn new(
        identifier: WorkflowIdentifier,
        shard_id: i32,
        executions: Arc<dyn ExecutionStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            identifier,
            shard_id,
            executions,
            history,
            lock: RunLock::new(),
            history_size: AtomicI64::new(0),
            condition: AtomicI64::new(EMPTY_EVENT_ID),
        }
    }

    /// Fail unless this run is still current at `condition` and the new run
    /// does not exist yet. Runs before any history is appended, so a lost
    /// race leaves both branches untouched. The caller holds this run's lock,
    /// and the current pointer only moves away from this run under that lock.
    async fn check_update_with_new(
        &self,
        condition: i64,
        new_identifier: &WorkflowIdentifier,
    ) -> Result<(), ContextError> {
        let stored = self
            .executions
            .get_workflow_execution(&self.identifier)
            .await?;
        if stored.next_event_id != condition {
            return Err(ContextError::conflict(format!(
                "run {} moved to event {}, expected {condition}",
                self.identifier, stored.next_event_id
            )));
        }

        let current = self
            .executions
            .get_current_execution(&self.identifier.namespace_id, &self.identifier.workflow_id)
            .await?;
        if current.run_id != self.identifier.run_id {
            return Err(ContextError::conflict(format!(
                "run {} is not current (current: {})",
                self.identifier, current.run_id
            )));
        }

        match self.executions.get_workflow_execution(new_identifier).await {
            Ok(_) => Err(ContextError::failed(format!(
                "run {new_identifier} already exists"
            ))),
            Err(ContextError::NotFound { .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn append(&self, events: &WorkflowEvents) -> Result<i64, ContextError> {
        let size = self
            .history
            .append_history_nodes(AppendHistoryNodesRequest {
                branch_token: events.branch_token.clone(),
                events: events.events.clone(),
                shard_id: self.shard_id,
            })
            .await?;
        Ok(size)
    }
}

#[async_trait]
impl RunContext for ExecutionContext {
    fn identifier(&self) -> &WorkflowIdentifier {
        &self.identifier
    }

    fn run_lock(&self) -> &RunLock {
        &self.lock
    }

    async fn load(&self) -> Result<Box<dyn MutableState>, ContextError> {
        let snapshot = self
            .executions
            .get_workflow_execution(&self.identifier)
            .await?;
        self.condition
            .store(snapshot.next_event_id, Ordering::SeqCst);
        tracing::debug!(
            run = %self.identifier,
            next_event_id = snapshot.next_event_id,
            "Loaded mutable state"
        );
        Ok(Box::new(WorkflowMutableState::from_snapshot(snapshot)))
    }

    async fn persist_first_event_batch(&self, events: &WorkflowEvents) -> Result<i64, ContextError> {
        self.append(events).await
    }

    async fn create_workflow_execution(
        &self,
        now: DateTime<Utc>,
        mode: CreateMode,
        prev_run_id: Option<RunId>,
        prev_last_write_version: i64,
        mut snapshot: WorkflowSnapshot,
        events_size: i64,
    ) -> Result<(), ContextError> {
        snapshot.execution_info.last_update_time = Some(now);
        let next_event_id = snapshot.next_event_id;
        self.executions
            .create_workflow_execution(CreateExecutionRequest {
                mode,
                prev_run_id,
                prev_last_write_version,
                snapshot,
            })
            .await?;
        let history_size = self
            .history_size
            .fetch_add(events_size, Ordering::SeqCst)
            .saturating_add(events_size);
        self.condition.store(next_event_id, Ordering::SeqCst);
        tracing::debug!(run = %self.identifier, ?mode, history_size, "Created run record");
        Ok(())
    }

    async fn update_with_new_as_active(
        &self,
        now: DateTime<Utc>,
        this_state: &mut dyn MutableState,
        new_context: &dyn RunContext,
        new_state: &mut dyn MutableState,
    ) -> Result<(), ContextError> {
        let condition = self.condition.load(Ordering::SeqCst);
        if condition == EMPTY_EVENT_ID {
            return Err(ContextError::failed(format!(
                "state of {} was never loaded",
                self.identifier
            )));
        }

        self.check_update_with_new(condition, new_context.identifier())
            .await?;

        let (snapshot, batches) =
            this_state.close_transaction_as_snapshot(now, TransactionPolicy::Active)?;
        let (new_snapshot, new_batches) =
            new_state.close_transaction_as_snapshot(now, TransactionPolicy::Active)?;

        for batch in &batches {
            let size = self.append(batch).await?;
            self.history_size.fetch_add(size, Ordering::SeqCst);
        }
        for batch in &new_batches {
            let size = new_context.persist_first_event_batch(batch).await?;
            new_context.set_history_size(new_context.history_size().saturating_add(size));
        }

        let next_event_id = snapshot.next_event_id;
        self.executions
            .update_workflow_execution_with_new(UpdateWithNewRequest {
                condition,
                snapshot,
                new_snapshot,
            })
            .await?;
        self.condition.store(next_event_id, Ordering::SeqCst);
        tracing::debug!(
            run = %self.identifier,
            new_run = %new_context.identifier(),
            "Committed run with new current run"
        );
        Ok(())
    }

    fn history_size(&self) -> i64 {
        self.history_size.load(Ordering::SeqCst)
    }

    fn set_history_size(&self, size: i64) {
        self.history_size.store(size, Ordering::SeqCst);
    }
}
