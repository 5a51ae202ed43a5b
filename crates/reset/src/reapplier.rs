//! Re-adding events that happened after a reset point onto the reset run.
//!
//! Only signals are reapplied. A range that ends in continue-as-new hands
//! over to the successor run, whose whole history is reapplied in turn,
//! until a run without a successor is reached.

use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;
use oya_core::{CancelSignal, RunId, WorkflowIdentifier, FIRST_EVENT_ID};
use oya_history::{BranchToken, EventAttributes, HistoryEvent, HistoryPaginator, PageToken};
use tracing::{debug, info};

use crate::cache::RunCache;
use crate::context::{ContextError, RunHandle};
use crate::error::{Error, Result};
use crate::state::MutableState;

/// The run and event range a reapplication chain starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapplySource {
    pub identifier: WorkflowIdentifier,
    pub branch_token: BranchToken,
    pub first_event_id: i64,
    /// Exclusive.
    pub next_event_id: i64,
}

/// Reapplies signals onto a target run, following continue-as-new chains.
#[derive(Clone)]
pub struct EventReapplier {
    paginator: HistoryPaginator,
    cache: Arc<dyn RunCache>,
}

impl EventReapplier {
    pub fn new(paginator: HistoryPaginator, cache: Arc<dyn RunCache>) -> Self {
        Self { paginator, cache }
    }

    /// Add every signal in `events` to `target`, in order; returns how many
    /// were added. Other event types are skipped.
    pub fn reapply_events(
        &self,
        target: &mut dyn MutableState,
        events: &[HistoryEvent],
    ) -> Result<usize> {
        let mut applied = 0_usize;
        for event in events {
            if let EventAttributes::WorkflowExecutionSignaled {
                signal_name,
                input,
                identity,
            } = &event.attributes
            {
                target
                    .add_workflow_signaled(signal_name, input.clone(), identity)
                    .map_err(|e| {
                        Error::event_reapply(
                            target.execution_info().identifier.run_id.clone(),
                            e.to_string(),
                        )
                    })?;
                applied = applied.saturating_add(1);
            }
        }
        Ok(applied)
    }

    /// Reapply `[first_event_id, next_event_id)` of `branch_token` page by page.
    /// An empty range reads nothing.
    ///
    /// Returns the successor run when the range ends in continue-as-new;
    /// reading stops at that event.
    pub async fn reapply_workflow_events(
        &self,
        cancel: &CancelSignal,
        target: &mut dyn MutableState,
        first_event_id: i64,
        next_event_id: i64,
        branch_token: BranchToken,
    ) -> Result<Option<RunId>> {
        if first_event_id >= next_event_id {
            return Ok(None);
        }
        let target_run = target.execution_info().identifier.run_id.clone();
        let mut fetch = self.paginator.pagination_fn(
            cancel.clone(),
            first_event_id,
            next_event_id,
            branch_token,
        );

        let mut token: Option<PageToken> = None;
        loop {
            let page = fetch(token)
                .await
                .map_err(|e| Error::pagination_read(target_run.clone(), e))?;

            let continued = page
                .items
                .iter()
                .find_position(|e| e.continued_as_new_run_id().is_some());
            if let Some((position, event)) = continued {
                let successor = event.continued_as_new_run_id().cloned();
                let before = page.items.get(..position).unwrap_or_default();
                self.reapply_events(target, before)?;
                return Ok(successor);
            }

            let applied = self.reapply_events(target, &page.items)?;
            debug!(run = %target_run, events = page.items.len(), applied, "Reapplied history page");

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Reapply the source range, then every continue-as-new successor's
    /// full history.
    pub async fn reapply_continue_as_new_workflow_events(
        &self,
        cancel: &CancelSignal,
        target: &mut dyn MutableState,
        source: ReapplySource,
    ) -> Result<()> {
        self.chase(cancel, target, source, None).await
    }

    /// Like [`Self::reapply_continue_as_new_workflow_events`], for a caller
    /// that already holds `held` locked. When the chain reaches that run its
    /// branch and next event ID are read from the held state instead of
    /// locking it again.
    pub async fn reapply_continue_as_new_workflow_events_holding(
        &self,
        cancel: &CancelSignal,
        target: &mut dyn MutableState,
        source: ReapplySource,
        held: &RunHandle,
    ) -> Result<()> {
        self.chase(cancel, target, source, Some(held)).await
    }

    async fn chase(
        &self,
        cancel: &CancelSignal,
        target: &mut dyn MutableState,
        source: ReapplySource,
        held: Option<&RunHandle>,
    ) -> Result<()> {
        info!(
            base = %source.identifier,
            first_event_id = source.first_event_id,
            next_event_id = source.next_event_id,
            "Reapplying events after reset point"
        );

        let mut visited = HashSet::from([source.identifier.run_id.clone()]);
        let mut successor = self
            .reapply_workflow_events(
                cancel,
                target,
                source.first_event_id,
                source.next_event_id,
                source.branch_token,
            )
            .await?;

        while let Some(run_id) = successor {
            if !visited.insert(run_id.clone()) {
                return Err(Error::successor_lookup(
                    run_id,
                    "continue-as-new chain revisits a run",
                ));
            }
            let identifier = source.identifier.with_run_id(run_id.clone());
            debug!(successor = %identifier, "Following continue-as-new successor");

            successor = match held.filter(|handle| handle.identifier() == &identifier) {
                Some(handle) => {
                    let next_event_id = handle.state().next_event_id();
                    let branch_token = handle.state().current_branch_token().clone();
                    self.reapply_workflow_events(
                        cancel,
                        target,
                        FIRST_EVENT_ID,
                        next_event_id,
                        branch_token,
                    )
                    .await?
                }
                None => {
                    let handle = self.lock_successor(cancel, &identifier).await?;
                    let next_event_id = handle.state().next_event_id();
                    let branch_token = handle.state().current_branch_token().clone();
                    let result = self
                        .reapply_workflow_events(
                            cancel,
                            target,
                            FIRST_EVENT_ID,
                            next_event_id,
                            branch_token,
                        )
                        .await;
                    handle.release();
                    result?
                }
            };
        }
        Ok(())
    }

    async fn lock_successor(
        &self,
        cancel: &CancelSignal,
        identifier: &WorkflowIdentifier,
    ) -> Result<RunHandle> {
        let lookup_failed = |e: ContextError| match e {
            ContextError::Cancelled(cancelled) => Error::Cancelled(cancelled),
            e => Error::successor_lookup(identifier.run_id.clone(), e.to_string()),
        };
        let context = self.cache.get_or_create(identifier).map_err(lookup_failed)?;
        RunHandle::lock_and_load(context, cancel)
            .await
            .map_err(lookup_failed)
    }
}
