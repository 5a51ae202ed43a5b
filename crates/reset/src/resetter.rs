//! Workflow reset orchestration.
//!
//! A reset forks the base run's history right after the reset point, replays
//! the shared prefix into a new run, closes out whatever was in flight at the
//! reset point, carries signals received after it over to the new run, and
//! commits the new run as the workflow's current run.

use std::sync::Arc;

use oya_core::{
    CancelSignal, GenericResultExt, HistoryServiceConfig, NamespaceId, RunId, WorkflowIdentifier,
    EMPTY_EVENT_ID, TRANSIENT_EVENT_ID,
};
use oya_history::{BranchToken, ForkBranchRequest, GcInfo, HistoryEvent, HistoryPaginator, HistoryStore};
use tracing::{debug, info, warn};

use crate::cache::RunCache;
use crate::context::RunHandle;
use crate::error::{Error, Result};
use crate::persistence::PersistenceCoordinator;
use crate::reapplier::{EventReapplier, ReapplySource};
use crate::rebuilder::{HistoryReplayRebuilder, RebuildRequest, StateRebuilder};
use crate::state::{ActivityFailure, DecisionFailure, MutableState};

/// Everything needed to reset one workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetRequest {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    /// Run whose history is reset.
    pub base_run_id: RunId,
    pub base_branch_token: BranchToken,
    /// Last event kept by the reset run.
    pub reset_last_event_id: i64,
    /// Version of the event at `reset_last_event_id`.
    pub reset_last_event_version: i64,
    /// Next event ID of the base run; events from `reset_last_event_id + 1`
    /// up to here are candidates for reapplication.
    pub base_next_event_id: i64,
    pub reset_run_id: RunId,
    pub request_id: String,
    pub reason: String,
    /// Terminate the current run and commit both runs atomically.
    pub current_is_terminated: bool,
    /// Extra events to reapply onto the reset run after the base range.
    pub additional_reapply_events: Vec<HistoryEvent>,
}

impl ResetRequest {
    pub fn base_identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(
            self.namespace_id.clone(),
            self.workflow_id.clone(),
            self.base_run_id.clone(),
        )
    }

    pub fn reset_identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(
            self.namespace_id.clone(),
            self.workflow_id.clone(),
            self.reset_run_id.clone(),
        )
    }
}

/// Resets workflow executions.
pub struct WorkflowResetter {
    config: HistoryServiceConfig,
    history: Arc<dyn HistoryStore>,
    cache: Arc<dyn RunCache>,
    rebuilder: Arc<dyn StateRebuilder>,
    reapplier: EventReapplier,
    persistence: PersistenceCoordinator,
}

impl WorkflowResetter {
    pub fn new(
        config: HistoryServiceConfig,
        history: Arc<dyn HistoryStore>,
        cache: Arc<dyn RunCache>,
        rebuilder: Arc<dyn StateRebuilder>,
    ) -> Self {
        let paginator = HistoryPaginator::new(Arc::clone(&history), &config);
        Self {
            reapplier: EventReapplier::new(paginator, Arc::clone(&cache)),
            persistence: PersistenceCoordinator::new(),
            config,
            history,
            cache,
            rebuilder,
        }
    }

    /// Resetter that rebuilds state by replaying history from `history`.
    pub fn with_history_replay(
        config: HistoryServiceConfig,
        history: Arc<dyn HistoryStore>,
        cache: Arc<dyn RunCache>,
    ) -> Self {
        let rebuilder = HistoryReplayRebuilder::new(HistoryPaginator::new(
            Arc::clone(&history),
            &config,
        ));
        Self::new(config, history, cache, Arc::new(rebuilder))
    }

    /// Reset a workflow; `current` is the workflow's current run, locked by
    /// the caller and still the caller's to release afterwards.
    ///
    /// Returns the committed reset run, still locked.
    pub async fn reset_workflow_execution(
        &self,
        cancel: &CancelSignal,
        request: ResetRequest,
        current: &mut RunHandle,
    ) -> Result<RunHandle> {
        info!(
            workflow = %request.base_identifier(),
            reset_run = %request.reset_run_id,
            reset_last_event_id = request.reset_last_event_id,
            terminate_current = request.current_is_terminated,
            "Resetting workflow"
        );

        self.reset(cancel, &request, current).await.tap_err(|e| {
            warn!(reset_run = %request.reset_run_id, error = %e, "Workflow reset aborted");
        })
    }

    async fn reset(
        &self,
        cancel: &CancelSignal,
        request: &ResetRequest,
        current: &mut RunHandle,
    ) -> Result<RunHandle> {
        let mut reset = self.replay_reset_workflow(cancel, request).await?;

        self.fail_reset_decision(reset.state_mut(), request)?;
        self.fail_inflight_activity(reset.state_mut(), &request.reason)?;

        let first_event_id = request
            .reset_last_event_id
            .checked_add(1)
            .ok_or_else(|| Error::replay(request.reset_run_id.clone(), "event ID overflow"))?;
        self.reapplier
            .reapply_continue_as_new_workflow_events_holding(
                cancel,
                reset.state_mut(),
                ReapplySource {
                    identifier: request.base_identifier(),
                    branch_token: request.base_branch_token.clone(),
                    first_event_id,
                    next_event_id: request.base_next_event_id,
                },
                current,
            )
            .await?;
        self.reapplier
            .reapply_events(reset.state_mut(), &request.additional_reapply_events)?;

        if !reset.state().has_pending_decision() {
            reset
                .state_mut()
                .add_decision_scheduled()
                .map_err(|e| Error::event_reapply(request.reset_run_id.clone(), e.to_string()))?;
        }

        if request.current_is_terminated {
            self.terminate_workflow(current.state_mut(), &request.reason)?;
        }

        self.persistence
            .persist_to_db(cancel, request.current_is_terminated, current, &mut reset)
            .await?;
        let cached = self.cache.put_if_absent(Arc::clone(reset.context()));
        if !Arc::ptr_eq(&cached, reset.context()) {
            warn!(reset_run = %reset.identifier(), "Reset run already had a cached context");
            return Err(Error::persistence(
                request.reset_run_id.clone(),
                "committed, but another context for the run is cached",
            ));
        }

        info!(
            reset_run = %reset.identifier(),
            next_event_id = reset.state().next_event_id(),
            "Workflow reset committed"
        );
        Ok(reset)
    }

    /// Fork `base_branch_token` so the new branch diverges at `fork_event_id`,
    /// tagged for garbage collection with the reset run.
    pub async fn generate_branch_token(
        &self,
        cancel: &CancelSignal,
        namespace_id: &NamespaceId,
        workflow_id: &str,
        base_branch_token: &BranchToken,
        fork_event_id: i64,
        reset_run_id: &RunId,
    ) -> Result<BranchToken> {
        cancel.check("fork_branch")?;
        let info = GcInfo::new(namespace_id.clone(), workflow_id, reset_run_id.clone());
        self.history
            .fork_branch(ForkBranchRequest {
                fork_branch_token: base_branch_token.clone(),
                fork_node_id: fork_event_id,
                info: info.to_string(),
                shard_id: self.config.shard_id,
            })
            .await
            .tap_ok(|token| debug!(fork_node = fork_event_id, branch = ?token, "Forked base history"))
            .map_err(|e| Error::branch_fork(reset_run_id.clone(), e))
    }

    /// Fork the base branch and replay its prefix into a new, locked run.
    pub async fn replay_reset_workflow(
        &self,
        cancel: &CancelSignal,
        request: &ResetRequest,
    ) -> Result<RunHandle> {
        let fork_event_id = request
            .reset_last_event_id
            .checked_add(1)
            .ok_or_else(|| Error::replay(request.reset_run_id.clone(), "event ID overflow"))?;
        let branch_token = self
            .generate_branch_token(
                cancel,
                &request.namespace_id,
                &request.workflow_id,
                &request.base_branch_token,
                fork_event_id,
                &request.reset_run_id,
            )
            .await?;

        let reset_identifier = request.reset_identifier();
        let context = self.cache.new_context(reset_identifier.clone());
        let guard = context.run_lock().acquire(cancel).await?;

        let (state, size) = self
            .rebuilder
            .rebuild(
                cancel,
                RebuildRequest {
                    base_identifier: request.base_identifier(),
                    base_branch_token: request.base_branch_token.clone(),
                    base_last_event_id: request.reset_last_event_id,
                    base_last_event_version: request.reset_last_event_version,
                    target_identifier: reset_identifier,
                    target_branch_token: branch_token,
                    request_id: request.request_id.clone(),
                },
            )
            .await?;
        context.set_history_size(size);

        Ok(RunHandle::new(context, state, guard))
    }

    /// Fail the decision that was in flight at the reset point; no worker
    /// can complete it on the reset run.
    fn fail_reset_decision(
        &self,
        state: &mut dyn MutableState,
        request: &ResetRequest,
    ) -> Result<()> {
        let Some(decision) = state.in_flight_decision() else {
            return Ok(());
        };
        state
            .add_decision_failed(
                decision.schedule_id,
                decision.started_id,
                DecisionFailure::reset(
                    self.config.system_identity.clone(),
                    request.reason.clone(),
                    request.base_run_id.clone(),
                    request.reset_run_id.clone(),
                    request.reset_last_event_version,
                ),
            )
            .map_err(|e| Error::decision_force_close(request.reset_run_id.clone(), e.to_string()))?;
        Ok(())
    }

    /// Fail every pending activity with `reason`. Stops at the first failure.
    pub fn fail_inflight_activity(&self, state: &mut dyn MutableState, reason: &str) -> Result<()> {
        for activity in state.pending_activities() {
            let failure = match activity.started_id {
                TRANSIENT_EVENT_ID => {
                    return Err(Error::activity_failure_apply(
                        activity.schedule_id,
                        "activity started under a retry policy has no persisted start",
                    ));
                }
                EMPTY_EVENT_ID => ActivityFailure {
                    schedule_id: activity.schedule_id,
                    started_id: EMPTY_EVENT_ID,
                    reason: reason.to_string(),
                    details: None,
                    identity: None,
                },
                started_id => ActivityFailure {
                    schedule_id: activity.schedule_id,
                    started_id,
                    reason: reason.to_string(),
                    details: activity.details.clone(),
                    identity: activity.started_identity.clone(),
                },
            };
            state
                .add_activity_failed(failure)
                .map_err(|e| Error::activity_failure_apply(activity.schedule_id, e.to_string()))?;
        }
        Ok(())
    }

    /// Terminate a run: force-fail its in-flight decision, flush buffered
    /// events, then append the terminated event.
    pub fn terminate_workflow(&self, state: &mut dyn MutableState, reason: &str) -> Result<()> {
        let run_id = state.execution_info().identifier.run_id.clone();
        let identity = self.config.system_identity.as_str();

        if let Some(decision) = state.in_flight_decision() {
            state
                .add_decision_failed(
                    decision.schedule_id,
                    decision.started_id,
                    DecisionFailure::force_close(identity),
                )
                .map_err(|e| Error::decision_force_close(run_id.clone(), e.to_string()))?;
        }
        state
            .flush_buffered_events()
            .map_err(|e| Error::decision_force_close(run_id.clone(), e.to_string()))?;

        let first_event_id = state.next_event_id();
        state
            .add_workflow_terminated(first_event_id, reason, None, identity)
            .map_err(|e| Error::termination_append(run_id, e.to_string()))?;
        Ok(())
    }
}
