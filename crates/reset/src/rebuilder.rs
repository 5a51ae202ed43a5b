//! Rebuilding mutable state by replaying a branch prefix.

use std::pin::pin;

use async_trait::async_trait;
use futures::TryStreamExt;
use oya_core::{CancelSignal, WorkflowIdentifier, FIRST_EVENT_ID};
use oya_history::{BranchToken, History, HistoryPaginator};

use crate::error::{Error, Result};
use crate::mutable_state::WorkflowMutableState;
use crate::state::MutableState;

/// What to replay and where the rebuilt state belongs.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildRequest {
    pub base_identifier: WorkflowIdentifier,
    pub base_branch_token: BranchToken,
    /// Last event replayed, inclusive.
    pub base_last_event_id: i64,
    /// Version the last replayed event must carry.
    pub base_last_event_version: i64,
    pub target_identifier: WorkflowIdentifier,
    pub target_branch_token: BranchToken,
    pub request_id: String,
}

/// Replays history into fresh mutable state.
#[async_trait]
pub trait StateRebuilder: Send + Sync {
    /// Rebuild state from `[FIRST_EVENT_ID, base_last_event_id]`; returns the
    /// state and the replayed history's byte size.
    async fn rebuild(
        &self,
        cancel: &CancelSignal,
        request: RebuildRequest,
    ) -> Result<(Box<dyn MutableState>, i64)>;
}

/// [`StateRebuilder`] paging the base branch into a [`WorkflowMutableState`].
pub struct HistoryReplayRebuilder {
    paginator: HistoryPaginator,
}

impl HistoryReplayRebuilder {
    pub fn new(paginator: HistoryPaginator) -> Self {
        Self { paginator }
    }
}

#[async_trait]
impl StateRebuilder for HistoryReplayRebuilder {
    async fn rebuild(
        &self,
        cancel: &CancelSignal,
        request: RebuildRequest,
    ) -> Result<(Box<dyn MutableState>, i64)> {
        let target_run = request.target_identifier.run_id.clone();
        let next_event_id = request
            .base_last_event_id
            .checked_add(1)
            .ok_or_else(|| Error::replay(target_run.clone(), "last event ID overflow"))?;

        let mut state = WorkflowMutableState::new(
            request.target_identifier.clone(),
            request.request_id.clone(),
            request.target_branch_token.clone(),
            request.base_last_event_version,
        );

        let mut events = pin!(self
            .paginator
            .iterator(
                cancel.clone(),
                FIRST_EVENT_ID,
                next_event_id,
                request.base_branch_token.clone(),
            )
            .into_stream());

        let mut replayed = Vec::new();
        while let Some(event) = events.try_next().await.map_err(|e| match e {
            oya_history::Error::Cancelled(cancelled) => Error::Cancelled(cancelled),
            e => Error::replay(target_run.clone(), e.to_string()),
        })? {
            state
                .replay_event(&event)
                .map_err(|e| Error::replay(target_run.clone(), e.to_string()))?;
            replayed.push(event);
        }

        let last = replayed.last().map(|e| (e.event_id, e.version));
        if last.map(|(id, _)| id) != Some(request.base_last_event_id) {
            return Err(Error::replay(
                target_run,
                format!(
                    "history of {} ends at {:?}, reset point is {}",
                    request.base_identifier,
                    last.map(|(id, _)| id),
                    request.base_last_event_id
                ),
            ));
        }
        if last.map(|(_, version)| version) != Some(request.base_last_event_version) {
            return Err(Error::replay(
                target_run,
                format!(
                    "event {} has version {:?}, expected {}",
                    request.base_last_event_id,
                    last.map(|(_, version)| version),
                    request.base_last_event_version
                ),
            ));
        }

        let size = History::new(replayed)
            .byte_size()
            .map_err(|e| Error::replay(target_run, e.to_string()))?;

        tracing::debug!(
            base = %request.base_identifier,
            target = %request.target_identifier,
            last_event_id = request.base_last_event_id,
            size,
            "Rebuilt mutable state"
        );
        let state: Box<dyn MutableState> = Box::new(state);
        Ok((state, size))
    }
}
