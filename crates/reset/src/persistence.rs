//! Committing the reset run.

use chrono::Utc;
use oya_core::{CancelSignal, RunId};
use tracing::{info, warn};

use crate::context::{ContextError, CreateMode, RunHandle};
use crate::error::{Error, Result};
use crate::state::TransactionPolicy;

/// Commits a reset run next to, or in place of, the workflow's current run.
///
/// Every commit is a single conditional write; a failed precondition is
/// reported as [`Error::PersistenceConflict`] and never retried here.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceCoordinator;

impl PersistenceCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Persist the reset run. Neither handle's lock is released.
    ///
    /// With `current_is_terminated` the current run's open transaction (its
    /// termination) and the reset run are committed together and the reset
    /// run becomes current. Otherwise the reset run is created as the
    /// successor of the current run, conditioned on the current run's ID and
    /// last write version.
    pub async fn persist_to_db(
        &self,
        cancel: &CancelSignal,
        current_is_terminated: bool,
        current: &mut RunHandle,
        reset: &mut RunHandle,
    ) -> Result<()> {
        cancel.check("persist_to_db")?;
        let now = Utc::now();
        let reset_run = reset.identifier().run_id.clone();

        if current_is_terminated {
            let (current_context, current_state) = current.parts_mut();
            let (reset_context, reset_state) = reset.parts_mut();
            current_context
                .update_with_new_as_active(now, current_state, reset_context, reset_state)
                .await
                .map_err(|e| persist_failed(&reset_run, e))?;
            info!(run = %reset_run, "Committed reset run with terminated current run");
            return Ok(());
        }

        let current_run_id = current.identifier().run_id.clone();
        let current_last_write_version = current.state().last_write_version();
        let (reset_context, reset_state) = reset.parts_mut();

        let (snapshot, batches) = reset_state
            .close_transaction_as_snapshot(now, TransactionPolicy::Active)
            .map_err(|e| Error::persistence(reset_run.clone(), e.to_string()))?;
        let [batch] = batches.as_slice() else {
            return Err(Error::persistence(
                reset_run,
                format!("expected exactly one event batch, got {}", batches.len()),
            ));
        };

        let size = reset_context
            .persist_first_event_batch(batch)
            .await
            .map_err(|e| persist_failed(&reset_run, e))?;

        reset_context
            .create_workflow_execution(
                now,
                CreateMode::ContinueAsNew,
                Some(current_run_id.clone()),
                current_last_write_version,
                snapshot,
                size,
            )
            .await
            .map_err(|e| persist_failed(&reset_run, e))?;

        info!(
            run = %reset_run,
            prev_run = %current_run_id,
            events_size = size,
            "Committed reset run as successor of current run"
        );
        Ok(())
    }
}

fn persist_failed(run_id: &RunId, error: ContextError) -> Error {
    match error {
        ContextError::Conflict { reason } => {
            warn!(run = %run_id, %reason, "Reset run lost the race for current run");
            Error::persistence_conflict(run_id.clone(), reason)
        }
        ContextError::Cancelled(cancelled) => Error::Cancelled(cancelled),
        other => Error::persistence(run_id.clone(), other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::DateTime;
    use oya_core::{cancel_pair, NamespaceId, WorkflowIdentifier};
    use oya_history::BranchToken;

    use super::*;
    use crate::context::{RunContext, RunLock};
    use crate::mutable_state::WorkflowMutableState;
    use crate::state::{MutableState, WorkflowEvents, WorkflowSnapshot};

    type CreateCall = (CreateMode, Option<RunId>, i64, i64);

    /// Records which commit operations were invoked.
    #[derive(Debug)]
    struct RecordingContext {
        identifier: WorkflowIdentifier,
        lock: RunLock,
        calls: Mutex<Vec<&'static str>>,
        created: Mutex<Option<CreateCall>>,
        history_size: AtomicI64,
    }

    impl RecordingContext {
        fn new(run: &str) -> Arc<Self> {
            Arc::new(Self {
                identifier: identifier(run),
                lock: RunLock::new(),
                calls: Mutex::new(Vec::new()),
                created: Mutex::new(None),
                history_size: AtomicI64::new(100),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RunContext for RecordingContext {
        fn identifier(&self) -> &WorkflowIdentifier {
            &self.identifier
        }

        fn run_lock(&self) -> &RunLock {
            &self.lock
        }

        async fn load(&self) -> std::result::Result<Box<dyn MutableState>, ContextError> {
            Err(ContextError::failed("not loadable"))
        }

        async fn persist_first_event_batch(
            &self,
            _events: &WorkflowEvents,
        ) -> std::result::Result<i64, ContextError> {
            self.calls.lock().unwrap().push("persist_first_event_batch");
            Ok(40)
        }

        async fn create_workflow_execution(
            &self,
            _now: DateTime<Utc>,
            mode: CreateMode,
            prev_run_id: Option<RunId>,
            prev_last_write_version: i64,
            _snapshot: WorkflowSnapshot,
            events_size: i64,
        ) -> std::result::Result<(), ContextError> {
            self.calls.lock().unwrap().push("create_workflow_execution");
            *self.created.lock().unwrap() =
                Some((mode, prev_run_id, prev_last_write_version, events_size));
            Ok(())
        }

        async fn update_with_new_as_active(
            &self,
            _now: DateTime<Utc>,
            _this_state: &mut dyn MutableState,
            _new_context: &dyn RunContext,
            _new_state: &mut dyn MutableState,
        ) -> std::result::Result<(), ContextError> {
            self.calls.lock().unwrap().push("update_with_new_as_active");
            Err(ContextError::conflict("current run moved"))
        }

        fn history_size(&self) -> i64 {
            self.history_size.load(Ordering::SeqCst)
        }

        fn set_history_size(&self, size: i64) {
            self.history_size.store(size, Ordering::SeqCst);
        }
    }

    fn identifier(run: &str) -> WorkflowIdentifier {
        WorkflowIdentifier::new(NamespaceId::new("ns"), "wf", RunId::new(run))
    }

    fn handle(context: Arc<RecordingContext>, version: i64, started: bool) -> RunHandle {
        let mut state = WorkflowMutableState::new(
            context.identifier.clone(),
            "req",
            BranchToken::new("b"),
            version,
        );
        if started {
            state
                .add_workflow_started("order", "orders", None, None, "client")
                .unwrap();
        }
        let guard = context.lock.try_acquire().unwrap();
        RunHandle::new(context, Box::new(state), guard)
    }

    #[tokio::test]
    async fn successor_commit_creates_once_against_current_run() {
        let current_ctx = RecordingContext::new("current");
        let reset_ctx = RecordingContext::new("reset");
        let mut current = handle(Arc::clone(&current_ctx), 7, false);
        let mut reset = handle(Arc::clone(&reset_ctx), 7, true);

        PersistenceCoordinator::new()
            .persist_to_db(&CancelSignal::never(), false, &mut current, &mut reset)
            .await
            .unwrap();

        assert!(current_ctx.calls().is_empty());
        assert_eq!(
            reset_ctx.calls(),
            vec!["persist_first_event_batch", "create_workflow_execution"]
        );
        assert_eq!(
            *reset_ctx.created.lock().unwrap(),
            Some((CreateMode::ContinueAsNew, Some(RunId::new("current")), 7, 40))
        );
        assert!(reset_ctx.lock.is_locked());
        assert!(current_ctx.lock.is_locked());
    }

    #[tokio::test]
    async fn terminating_commit_updates_once_and_maps_conflict() {
        let current_ctx = RecordingContext::new("current");
        let reset_ctx = RecordingContext::new("reset");
        let mut current = handle(Arc::clone(&current_ctx), 1, true);
        let mut reset = handle(Arc::clone(&reset_ctx), 1, true);

        let err = PersistenceCoordinator::new()
            .persist_to_db(&CancelSignal::never(), true, &mut current, &mut reset)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PersistenceConflict { .. }));
        assert_eq!(current_ctx.calls(), vec!["update_with_new_as_active"]);
        assert!(reset_ctx.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_commit_touches_nothing() {
        let current_ctx = RecordingContext::new("current");
        let reset_ctx = RecordingContext::new("reset");
        let mut current = handle(Arc::clone(&current_ctx), 1, true);
        let mut reset = handle(Arc::clone(&reset_ctx), 1, true);
        let (cancel, signal) = cancel_pair();
        cancel.cancel();

        let err = PersistenceCoordinator::new()
            .persist_to_db(&signal, false, &mut current, &mut reset)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(current_ctx.calls().is_empty());
        assert!(reset_ctx.calls().is_empty());
    }
}
