//! History event types.

use chrono::{DateTime, Utc};
use oya_core::RunId;
use serde::{Deserialize, Serialize};

/// Type tag of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskFailed,
    DecisionTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    TimerStarted,
    TimerFired,
}

impl EventType {
    /// Whether the event closes the run.
    pub fn is_workflow_close(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionTerminated
                | Self::WorkflowExecutionContinuedAsNew
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why a decision task was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    /// The worker reported an unhandled failure.
    WorkflowWorkerUnhandledFailure,
    /// The history service force-closed an in-flight decision.
    ForceCloseDecision,
    /// The decision was abandoned because the workflow was reset.
    ResetWorkflow,
}

/// Type-specific attributes of a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Option<Vec<u8>>,
        continued_execution_run_id: Option<RunId>,
        identity: String,
    },
    WorkflowExecutionCompleted {
        result: Option<Vec<u8>>,
    },
    WorkflowExecutionFailed {
        reason: String,
        details: Option<Vec<u8>>,
    },
    WorkflowExecutionTerminated {
        reason: String,
        details: Option<Vec<u8>>,
        identity: String,
    },
    WorkflowExecutionContinuedAsNew {
        new_execution_run_id: RunId,
        input: Option<Vec<u8>>,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Option<Vec<u8>>,
        identity: String,
    },
    DecisionTaskScheduled {
        task_list: String,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: String,
    },
    DecisionTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: DecisionTaskFailedCause,
        details: Option<Vec<u8>>,
        identity: String,
        reason: String,
        base_run_id: Option<RunId>,
        new_run_id: Option<RunId>,
        fork_event_version: i64,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        attempt: i32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        result: Option<Vec<u8>>,
        identity: String,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: String,
        details: Option<Vec<u8>>,
        identity: String,
    },
    TimerStarted {
        timer_id: String,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
}

impl EventAttributes {
    /// The type tag matching these attributes.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            Self::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            Self::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            Self::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            Self::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            Self::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            Self::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            Self::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            Self::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            Self::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
            Self::DecisionTaskTimedOut { .. } => EventType::DecisionTaskTimedOut,
            Self::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            Self::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            Self::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            Self::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            Self::TimerStarted { .. } => EventType::TimerStarted,
            Self::TimerFired { .. } => EventType::TimerFired,
        }
    }
}

/// One immutable record of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_id: i64, version: i64, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            version,
            timestamp: Utc::now(),
            attributes,
        }
    }

    /// The event's type tag.
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    /// Successor run ID if this is a continue-as-new event.
    pub fn continued_as_new_run_id(&self) -> Option<&RunId> {
        match &self.attributes {
            EventAttributes::WorkflowExecutionContinuedAsNew {
                new_execution_run_id,
                ..
            } => Some(new_execution_run_id),
            _ => None,
        }
    }

    /// Shorthand for a signal event.
    pub fn signaled(
        event_id: i64,
        version: i64,
        signal_name: impl Into<String>,
        input: Option<Vec<u8>>,
        identity: impl Into<String>,
    ) -> Self {
        Self::new(
            event_id,
            version,
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: signal_name.into(),
                input,
                identity: identity.into(),
            },
        )
    }
}

/// One batch of events written by a single transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct History {
    pub events: Vec<HistoryEvent>,
}

impl History {
    /// Create a batch from events.
    pub fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }

    /// ID of the first event, if any.
    pub fn first_event_id(&self) -> Option<i64> {
        self.events.first().map(|e| e.event_id)
    }

    /// ID of the last event, if any.
    pub fn last_event_id(&self) -> Option<i64> {
        self.events.last().map(|e| e.event_id)
    }

    /// Encoded size of the batch in bytes.
    pub fn byte_size(&self) -> crate::error::Result<i64> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| crate::error::Error::serialization(e.to_string()))?;
        i64::try_from(encoded.len()).map_err(|e| crate::error::Error::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_determine_event_type() {
        let event = HistoryEvent::signaled(7, 1, "sig", None, "client");
        assert_eq!(event.event_type(), EventType::WorkflowExecutionSignaled);
        assert!(event.continued_as_new_run_id().is_none());
    }

    #[test]
    fn continued_as_new_exposes_successor() {
        let event = HistoryEvent::new(
            9,
            1,
            EventAttributes::WorkflowExecutionContinuedAsNew {
                new_execution_run_id: RunId::new("next"),
                input: None,
            },
        );
        assert_eq!(event.continued_as_new_run_id(), Some(&RunId::new("next")));
        assert!(event.event_type().is_workflow_close());
    }

    #[test]
    fn batch_bounds_and_size() {
        let batch = History::new(vec![
            HistoryEvent::signaled(3, 1, "a", None, "c"),
            HistoryEvent::signaled(4, 1, "b", None, "c"),
        ]);
        assert_eq!(batch.first_event_id(), Some(3));
        assert_eq!(batch.last_event_id(), Some(4));
        assert!(batch.byte_size().map_or(0, |s| s) > 0);
        assert_eq!(History::default().first_event_id(), None);
    }
}
