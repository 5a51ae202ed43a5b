//! In-memory mutable state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use oya_core::{RunId, WorkflowIdentifier, BUFFERED_EVENT_ID, EMPTY_EVENT_ID, FIRST_EVENT_ID};
use oya_history::{BranchToken, EventAttributes, HistoryEvent};

use crate::state::{
    ActivityFailure, ActivityInfo, DecisionFailure, DecisionInfo, ExecutionInfo, ExecutionStatus,
    MutableState, StateError, TransactionPolicy, WorkflowEvents, WorkflowSnapshot,
};

/// Mutable state held in memory and derived by applying history events.
///
/// Events added through the `add_*` operations are applied immediately and
/// collected in an open transaction until the transaction is closed.
#[derive(Debug, Clone)]
pub struct WorkflowMutableState {
    execution_info: ExecutionInfo,
    next_event_id: i64,
    last_write_version: i64,
    current_version: i64,
    branch_token: BranchToken,
    pending_activities: BTreeMap<i64, ActivityInfo>,
    decision: Option<DecisionInfo>,
    buffered_events: Vec<HistoryEvent>,
    transaction: Vec<HistoryEvent>,
}

impl WorkflowMutableState {
    /// Empty state for a run whose history starts on `branch_token`.
    pub fn new(
        identifier: WorkflowIdentifier,
        create_request_id: impl Into<String>,
        branch_token: BranchToken,
        version: i64,
    ) -> Self {
        Self {
            execution_info: ExecutionInfo::new(identifier, create_request_id),
            next_event_id: FIRST_EVENT_ID,
            last_write_version: version,
            current_version: version,
            branch_token,
            pending_activities: BTreeMap::new(),
            decision: None,
            buffered_events: Vec::new(),
            transaction: Vec::new(),
        }
    }

    /// Restore state from its persisted form.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self {
            execution_info: snapshot.execution_info,
            next_event_id: snapshot.next_event_id,
            last_write_version: snapshot.last_write_version,
            current_version: snapshot.current_version,
            branch_token: snapshot.branch_token,
            pending_activities: snapshot
                .pending_activities
                .into_iter()
                .map(|a| (a.schedule_id, a))
                .collect(),
            decision: snapshot.decision,
            buffered_events: snapshot.buffered_events,
            transaction: Vec::new(),
        }
    }

    /// Persisted form of the current state.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            next_event_id: self.next_event_id,
            last_write_version: self.last_write_version,
            current_version: self.current_version,
            branch_token: self.branch_token.clone(),
            pending_activities: self.pending_activities.values().cloned().collect(),
            decision: self.decision.clone(),
            buffered_events: self.buffered_events.clone(),
        }
    }

    /// Apply an already-persisted event. Events must arrive gapless and in order.
    pub fn replay_event(&mut self, event: &HistoryEvent) -> Result<(), StateError> {
        if event.event_id != self.next_event_id {
            return Err(StateError::new(
                "replay_event",
                format!(
                    "expected event {}, got {}",
                    self.next_event_id, event.event_id
                ),
            ));
        }
        self.apply("replay_event", event)?;
        self.next_event_id = self.next_event_id_after("replay_event")?;
        self.last_write_version = event.version;
        self.current_version = event.version;
        Ok(())
    }

    /// Version stamped on subsequently added events.
    pub fn set_current_version(&mut self, version: i64) {
        self.current_version = version;
    }

    /// Events waiting for the in-flight decision to close.
    pub fn buffered_events(&self) -> &[HistoryEvent] {
        &self.buffered_events
    }

    /// Events added since the last closed transaction.
    pub fn pending_transaction(&self) -> &[HistoryEvent] {
        &self.transaction
    }

    pub fn add_workflow_started(
        &mut self,
        workflow_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        continued_execution_run_id: Option<RunId>,
        identity: &str,
    ) -> Result<HistoryEvent, StateError> {
        if self.next_event_id != FIRST_EVENT_ID {
            return Err(StateError::new(
                "add_workflow_started",
                "run already started",
            ));
        }
        self.add_event(
            "add_workflow_started",
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: workflow_type.to_string(),
                task_list: task_list.to_string(),
                input,
                continued_execution_run_id,
                identity: identity.to_string(),
            },
        )
    }

    pub fn add_decision_started(
        &mut self,
        schedule_id: i64,
        identity: &str,
        request_id: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_decision_started")?;
        self.add_event(
            "add_decision_started",
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id: schedule_id,
                identity: identity.to_string(),
                request_id: request_id.to_string(),
            },
        )
    }

    pub fn add_decision_completed(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_decision_completed")?;
        self.add_event(
            "add_decision_completed",
            EventAttributes::DecisionTaskCompleted {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                identity: identity.to_string(),
            },
        )
    }

    pub fn add_activity_scheduled(
        &mut self,
        activity_id: &str,
        activity_type: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_activity_scheduled")?;
        self.add_event(
            "add_activity_scheduled",
            EventAttributes::ActivityTaskScheduled {
                activity_id: activity_id.to_string(),
                activity_type: activity_type.to_string(),
            },
        )
    }

    pub fn add_activity_started(
        &mut self,
        schedule_id: i64,
        identity: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_activity_started")?;
        let attempt = self
            .pending_activities
            .get(&schedule_id)
            .map_or(0, |a| a.attempt);
        self.add_event(
            "add_activity_started",
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id: schedule_id,
                identity: identity.to_string(),
                attempt,
            },
        )
    }

    /// Store heartbeat details on a started activity.
    pub fn record_activity_heartbeat(
        &mut self,
        schedule_id: i64,
        details: Vec<u8>,
    ) -> Result<(), StateError> {
        let activity = self
            .pending_activities
            .get_mut(&schedule_id)
            .filter(|a| a.is_started())
            .ok_or_else(|| {
                StateError::new(
                    "record_activity_heartbeat",
                    format!("no started activity scheduled at {schedule_id}"),
                )
            })?;
        activity.details = Some(details);
        Ok(())
    }

    pub fn add_continued_as_new(
        &mut self,
        new_execution_run_id: RunId,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_continued_as_new")?;
        let batch_id = self.transaction_first_event_id();
        let event = self.add_event(
            "add_continued_as_new",
            EventAttributes::WorkflowExecutionContinuedAsNew {
                new_execution_run_id,
                input: None,
            },
        )?;
        self.execution_info.completion_event_batch_id = Some(batch_id);
        Ok(event)
    }

    fn transaction_first_event_id(&self) -> i64 {
        self.transaction
            .first()
            .map_or(self.next_event_id, |e| e.event_id)
    }

    fn require_running(&self, operation: &str) -> Result<(), StateError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StateError::new(
                operation,
                format!("run is {:?}", self.execution_info.status),
            ))
        }
    }

    fn next_event_id_after(&self, operation: &str) -> Result<i64, StateError> {
        self.next_event_id
            .checked_add(1)
            .ok_or_else(|| StateError::new(operation, "event ID overflow"))
    }

    /// Stamp, apply and record a new event.
    fn add_event(
        &mut self,
        operation: &str,
        attributes: EventAttributes,
    ) -> Result<HistoryEvent, StateError> {
        let event = HistoryEvent::new(self.next_event_id, self.current_version, attributes);
        let next = self.next_event_id_after(operation)?;
        self.apply(operation, &event)?;
        self.next_event_id = next;
        self.transaction.push(event.clone());
        Ok(event)
    }

    fn take_decision(&mut self, operation: &str, schedule_id: i64) -> Result<(), StateError> {
        match &self.decision {
            Some(decision) if decision.schedule_id == schedule_id => {
                self.decision = None;
                Ok(())
            }
            _ => Err(StateError::new(
                operation,
                format!("no decision scheduled at {schedule_id}"),
            )),
        }
    }

    fn take_activity(&mut self, operation: &str, schedule_id: i64) -> Result<(), StateError> {
        self.pending_activities
            .remove(&schedule_id)
            .map(|_| ())
            .ok_or_else(|| {
                StateError::new(
                    operation,
                    format!("no pending activity scheduled at {schedule_id}"),
                )
            })
    }

    fn close(&mut self, status: ExecutionStatus) {
        self.execution_info.status = status;
        self.decision = None;
    }

    /// Fold one event into the state. Validation happens before any mutation.
    fn apply(&mut self, operation: &str, event: &HistoryEvent) -> Result<(), StateError> {
        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_list,
                continued_execution_run_id,
                ..
            } => {
                self.execution_info.workflow_type.clone_from(workflow_type);
                self.execution_info.task_list.clone_from(task_list);
                self.execution_info
                    .continued_execution_run_id
                    .clone_from(continued_execution_run_id);
                self.execution_info.status = ExecutionStatus::Running;
                self.execution_info.start_time = Some(event.timestamp);
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                self.close(ExecutionStatus::Completed);
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.close(ExecutionStatus::Failed);
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.close(ExecutionStatus::Terminated);
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.close(ExecutionStatus::ContinuedAsNew);
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                self.execution_info.signal_count =
                    self.execution_info.signal_count.saturating_add(1);
            }
            EventAttributes::DecisionTaskScheduled { attempt, .. } => {
                if self.decision.is_some() {
                    return Err(StateError::new(operation, "a decision is already pending"));
                }
                self.decision = Some(DecisionInfo {
                    version: event.version,
                    schedule_id: event.event_id,
                    started_id: EMPTY_EVENT_ID,
                    attempt: *attempt,
                });
            }
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id, ..
            } => match self.decision.as_mut() {
                Some(decision)
                    if decision.schedule_id == *scheduled_event_id && !decision.is_in_flight() =>
                {
                    decision.started_id = event.event_id;
                }
                _ => {
                    return Err(StateError::new(
                        operation,
                        format!("no unstarted decision scheduled at {scheduled_event_id}"),
                    ))
                }
            },
            EventAttributes::DecisionTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::DecisionTaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id, ..
            } => self.take_decision(operation, *scheduled_event_id)?,
            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
            } => {
                self.pending_activities.insert(
                    event.event_id,
                    ActivityInfo {
                        version: event.version,
                        schedule_id: event.event_id,
                        started_id: EMPTY_EVENT_ID,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        attempt: 0,
                        details: None,
                        started_identity: None,
                    },
                );
            }
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id,
                identity,
                attempt,
            } => match self.pending_activities.get_mut(scheduled_event_id) {
                Some(activity) if !activity.is_started() => {
                    activity.started_id = event.event_id;
                    activity.started_identity = Some(identity.clone());
                    activity.attempt = *attempt;
                }
                _ => {
                    return Err(StateError::new(
                        operation,
                        format!("no unstarted activity scheduled at {scheduled_event_id}"),
                    ))
                }
            },
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id, ..
            } => self.take_activity(operation, *scheduled_event_id)?,
            EventAttributes::TimerStarted { .. } | EventAttributes::TimerFired { .. } => {}
        }
        self.execution_info.last_update_time = Some(event.timestamp);
        Ok(())
    }

    fn flush(&mut self, operation: &str) -> Result<(), StateError> {
        let buffered = std::mem::take(&mut self.buffered_events);
        for pending in buffered {
            self.add_event(operation, pending.attributes)?;
        }
        Ok(())
    }
}

impl MutableState for WorkflowMutableState {
    fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    fn last_write_version(&self) -> i64 {
        self.last_write_version
    }

    fn current_version(&self) -> i64 {
        self.current_version
    }

    fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    fn current_branch_token(&self) -> &BranchToken {
        &self.branch_token
    }

    fn is_running(&self) -> bool {
        self.execution_info.status == ExecutionStatus::Running
    }

    fn pending_activities(&self) -> Vec<ActivityInfo> {
        self.pending_activities.values().cloned().collect()
    }

    fn in_flight_decision(&self) -> Option<DecisionInfo> {
        self.decision.clone().filter(DecisionInfo::is_in_flight)
    }

    fn has_pending_decision(&self) -> bool {
        self.decision.is_some()
    }

    fn add_activity_failed(
        &mut self,
        failure: ActivityFailure,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_activity_failed")?;
        match self.pending_activities.get(&failure.schedule_id) {
            Some(activity) if activity.started_id == failure.started_id => {}
            Some(activity) => {
                return Err(StateError::new(
                    "add_activity_failed",
                    format!(
                        "activity {} started at {}, not {}",
                        activity.schedule_id, activity.started_id, failure.started_id
                    ),
                ))
            }
            None => {
                return Err(StateError::new(
                    "add_activity_failed",
                    format!("no pending activity scheduled at {}", failure.schedule_id),
                ))
            }
        }
        self.add_event(
            "add_activity_failed",
            EventAttributes::ActivityTaskFailed {
                scheduled_event_id: failure.schedule_id,
                started_event_id: failure.started_id,
                reason: failure.reason,
                details: failure.details,
                identity: failure.identity.unwrap_or_default(),
            },
        )
    }

    fn add_decision_failed(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        failure: DecisionFailure,
    ) -> Result<HistoryEvent, StateError> {
        match &self.decision {
            Some(decision)
                if decision.schedule_id == schedule_id && decision.started_id == started_id => {}
            _ => {
                return Err(StateError::new(
                    "add_decision_failed",
                    format!("no decision scheduled at {schedule_id} and started at {started_id}"),
                ))
            }
        }
        self.add_event(
            "add_decision_failed",
            EventAttributes::DecisionTaskFailed {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                cause: failure.cause,
                details: failure.details,
                identity: failure.identity,
                reason: failure.reason,
                base_run_id: failure.base_run_id,
                new_run_id: failure.new_run_id,
                fork_event_version: failure.fork_event_version,
            },
        )
    }

    fn add_decision_scheduled(&mut self) -> Result<DecisionInfo, StateError> {
        self.require_running("add_decision_scheduled")?;
        let event = self.add_event(
            "add_decision_scheduled",
            EventAttributes::DecisionTaskScheduled {
                task_list: self.execution_info.task_list.clone(),
                attempt: 0,
            },
        )?;
        self.decision
            .clone()
            .filter(|d| d.schedule_id == event.event_id)
            .ok_or_else(|| StateError::new("add_decision_scheduled", "decision not recorded"))
    }

    fn flush_buffered_events(&mut self) -> Result<(), StateError> {
        if self.in_flight_decision().is_some() {
            return Err(StateError::new(
                "flush_buffered_events",
                "cannot flush while a decision is in flight",
            ));
        }
        self.flush("flush_buffered_events")
    }

    fn add_workflow_terminated(
        &mut self,
        first_event_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_workflow_terminated")?;
        if first_event_id < FIRST_EVENT_ID || first_event_id > self.next_event_id {
            return Err(StateError::new(
                "add_workflow_terminated",
                format!(
                    "batch ID {first_event_id} outside [{FIRST_EVENT_ID}, {}]",
                    self.next_event_id
                ),
            ));
        }
        if !self.buffered_events.is_empty() {
            return Err(StateError::new(
                "add_workflow_terminated",
                "buffered events must be flushed first",
            ));
        }
        let event = self.add_event(
            "add_workflow_terminated",
            EventAttributes::WorkflowExecutionTerminated {
                reason: reason.to_string(),
                details,
                identity: identity.to_string(),
            },
        )?;
        self.execution_info.completion_event_batch_id = Some(first_event_id);
        Ok(event)
    }

    fn add_workflow_signaled(
        &mut self,
        signal_name: &str,
        input: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<HistoryEvent, StateError> {
        self.require_running("add_workflow_signaled")?;
        let attributes = EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
            identity: identity.to_string(),
        };
        if self.in_flight_decision().is_some() {
            let event = HistoryEvent::new(BUFFERED_EVENT_ID, self.current_version, attributes);
            self.buffered_events.push(event.clone());
            return Ok(event);
        }
        self.add_event("add_workflow_signaled", attributes)
    }

    fn close_transaction_as_snapshot(
        &mut self,
        now: DateTime<Utc>,
        policy: TransactionPolicy,
    ) -> Result<(WorkflowSnapshot, Vec<WorkflowEvents>), StateError> {
        if policy == TransactionPolicy::Active && self.in_flight_decision().is_none() {
            self.flush("close_transaction_as_snapshot")?;
        }

        let events = std::mem::take(&mut self.transaction);
        if !events.is_empty() {
            self.last_write_version = self.current_version;
        }
        self.execution_info.last_update_time = Some(now);

        let batches = if events.is_empty() {
            Vec::new()
        } else {
            vec![WorkflowEvents {
                identifier: self.execution_info.identifier.clone(),
                branch_token: self.branch_token.clone(),
                events,
            }]
        };
        Ok((self.snapshot(), batches))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use oya_core::NamespaceId;
    use oya_history::EventType;

    use super::*;

    fn started_state() -> WorkflowMutableState {
        let identifier = WorkflowIdentifier::new(NamespaceId::new("ns"), "wf", RunId::new("r1"));
        let mut state =
            WorkflowMutableState::new(identifier, "req", BranchToken::new("branch"), 1);
        state
            .add_workflow_started("order", "orders", None, None, "client")
            .unwrap();
        state
    }

    #[test]
    fn replay_rejects_gaps() {
        let mut state = started_state();
        let gap = HistoryEvent::signaled(5, 1, "s", None, "c");
        let err = state.replay_event(&gap).unwrap_err();
        assert_eq!(err.operation, "replay_event");
        assert_eq!(state.next_event_id(), 2);
    }

    #[test]
    fn signals_buffer_while_decision_in_flight() {
        let mut state = started_state();
        let decision = state.add_decision_scheduled().unwrap();
        let started = state
            .add_decision_started(decision.schedule_id, "worker", "poll-1")
            .unwrap();

        let buffered = state.add_workflow_signaled("s1", None, "client").unwrap();
        assert_eq!(buffered.event_id, BUFFERED_EVENT_ID);
        assert_eq!(state.buffered_events().len(), 1);
        assert!(state.flush_buffered_events().is_err());

        state
            .add_decision_failed(
                decision.schedule_id,
                started.event_id,
                DecisionFailure::force_close("history-service"),
            )
            .unwrap();
        state.flush_buffered_events().unwrap();

        assert!(state.buffered_events().is_empty());
        let last = state.pending_transaction().last().unwrap();
        assert_eq!(last.event_type(), EventType::WorkflowExecutionSignaled);
        assert_eq!(last.event_id, state.next_event_id() - 1);
        assert_eq!(state.execution_info().signal_count, 1);
    }

    #[test]
    fn close_transaction_yields_one_batch_and_bumps_write_version() {
        let mut state = started_state();
        state.set_current_version(7);
        state.add_activity_scheduled("a1", "charge").unwrap();

        let (snapshot, batches) = state
            .close_transaction_as_snapshot(Utc::now(), TransactionPolicy::Active)
            .unwrap();

        assert_eq!(batches.len(), 1);
        let ids: Vec<i64> = batches[0].events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(snapshot.last_write_version, 7);
        assert_eq!(snapshot.pending_activities.len(), 1);

        let (_, empty) = state
            .close_transaction_as_snapshot(Utc::now(), TransactionPolicy::Active)
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn activity_failure_must_match_started_id() {
        let mut state = started_state();
        let scheduled = state.add_activity_scheduled("a1", "charge").unwrap();
        state.add_activity_started(scheduled.event_id, "worker").unwrap();

        let err = state.add_activity_failed(ActivityFailure {
            schedule_id: scheduled.event_id,
            started_id: EMPTY_EVENT_ID,
            reason: "reset".to_string(),
            details: None,
            identity: None,
        });
        assert!(err.is_err());
        assert_eq!(state.pending_activities().len(), 1);
    }

    #[test]
    fn terminated_run_rejects_further_events() {
        let mut state = started_state();
        let next = state.next_event_id();
        state
            .add_workflow_terminated(next, "reset", None, "history-service")
            .unwrap();

        assert!(!state.is_running());
        assert_eq!(state.execution_info().completion_event_batch_id, Some(next));
        assert!(state.add_workflow_signaled("late", None, "c").is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_pending_work() {
        let mut state = started_state();
        state.add_activity_scheduled("a1", "charge").unwrap();
        state.add_decision_scheduled().unwrap();

        let restored = WorkflowMutableState::from_snapshot(state.snapshot());
        assert_eq!(restored.next_event_id(), state.next_event_id());
        assert_eq!(restored.pending_activities(), state.pending_activities());
        assert!(restored.has_pending_decision());
        assert!(restored.pending_transaction().is_empty());
    }
}
