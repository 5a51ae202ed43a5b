//! Shared fixtures for reset integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use oya_core::{CancelSignal, HistoryServiceConfig, NamespaceId, RunId, WorkflowIdentifier};
use oya_history::{
    AppendHistoryNodesRequest, BranchToken, EventAttributes, ForkBranchRequest, HistoryEvent,
    HistoryStore, InMemoryHistoryStore, ReadHistoryBranchRequest, ReadHistoryBranchResponse,
};
use oya_reset::{
    CreateExecutionRequest, CreateMode, ExecutionCache, ExecutionStore, InMemoryExecutionStore,
    MutableState, ResetRequest, RunCache, RunHandle, TransactionPolicy, WorkflowMutableState,
    WorkflowResetter,
};

pub const NAMESPACE: &str = "ns";
pub const WORKFLOW: &str = "wf";
pub const VERSION: i64 = 1;

// ==========================================================================
// RECORDING HISTORY STORE
// ==========================================================================

/// In-memory history store that records fork requests and can be told to
/// fail reads of chosen branches.
#[derive(Default)]
pub struct RecordingHistoryStore {
    pub inner: InMemoryHistoryStore,
    pub forks: Mutex<Vec<ForkBranchRequest>>,
    pub unreadable: Mutex<Vec<BranchToken>>,
}

impl RecordingHistoryStore {
    pub fn fork_requests(&self) -> Vec<ForkBranchRequest> {
        self.forks.lock().unwrap().clone()
    }

    pub fn fail_reads_of(&self, branch_token: &BranchToken) {
        self.unreadable.lock().unwrap().push(branch_token.clone());
    }
}

#[async_trait]
impl HistoryStore for RecordingHistoryStore {
    async fn new_branch(&self, shard_id: i32) -> oya_history::Result<BranchToken> {
        self.inner.new_branch(shard_id).await
    }

    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> oya_history::Result<i64> {
        self.inner.append_history_nodes(request).await
    }

    async fn fork_branch(&self, request: ForkBranchRequest) -> oya_history::Result<BranchToken> {
        self.forks.lock().unwrap().push(request.clone());
        self.inner.fork_branch(request).await
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> oya_history::Result<ReadHistoryBranchResponse> {
        if self.unreadable.lock().unwrap().contains(&request.branch_token) {
            return Err(oya_history::Error::read_failed("storage unavailable"));
        }
        self.inner.read_history_branch(request).await
    }
}

// ==========================================================================
// HARNESS
// ==========================================================================

/// A resetter wired to in-memory stores.
pub struct Harness {
    pub config: HistoryServiceConfig,
    pub history: Arc<RecordingHistoryStore>,
    pub executions: Arc<InMemoryExecutionStore>,
    pub cache: Arc<ExecutionCache>,
    pub resetter: WorkflowResetter,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HistoryServiceConfig::for_shard(1))
    }

    pub fn with_config(config: HistoryServiceConfig) -> Self {
        let history = Arc::new(RecordingHistoryStore::default());
        let executions = InMemoryExecutionStore::new_arc();
        let cache = Arc::new(ExecutionCache::new(
            &config,
            executions.clone(),
            history.clone(),
        ));
        let resetter =
            WorkflowResetter::with_history_replay(config.clone(), history.clone(), cache.clone());
        Self {
            config,
            history,
            executions,
            cache,
            resetter,
        }
    }

    /// A started run on a fresh branch; nothing is persisted yet.
    pub async fn start_run(
        &self,
        run_id: &str,
        continued_from: Option<&str>,
    ) -> WorkflowMutableState {
        let branch = self.history.new_branch(self.config.shard_id).await.unwrap();
        let mut state = WorkflowMutableState::new(identifier(run_id), "create-req", branch, VERSION);
        state
            .add_workflow_started(
                "order-workflow",
                "orders",
                None,
                continued_from.map(RunId::new),
                "client",
            )
            .unwrap();
        state
    }

    /// Close the open transaction and append it to the run's branch.
    pub async fn commit_batch(&self, state: &mut WorkflowMutableState) {
        let (_, batches) = state
            .close_transaction_as_snapshot(Utc::now(), TransactionPolicy::Active)
            .unwrap();
        for batch in batches {
            self.history
                .append_history_nodes(AppendHistoryNodesRequest {
                    branch_token: batch.branch_token,
                    events: batch.events,
                    shard_id: self.config.shard_id,
                })
                .await
                .unwrap();
        }
    }

    /// Commit the open transaction and create the run record. With
    /// `previous` the run replaces that run as current.
    pub async fn create_run(
        &self,
        state: &mut WorkflowMutableState,
        previous: Option<(&RunId, i64)>,
    ) {
        self.commit_batch(state).await;
        let (mode, prev_run_id, prev_last_write_version) = match previous {
            Some((run_id, version)) => (CreateMode::ContinueAsNew, Some(run_id.clone()), version),
            None => (CreateMode::BrandNew, None, 0),
        };
        self.executions
            .create_workflow_execution(CreateExecutionRequest {
                mode,
                prev_run_id,
                prev_last_write_version,
                snapshot: state.snapshot(),
            })
            .await
            .unwrap();
    }

    /// Lock and load a run through the shared cache.
    pub async fn lock_run(&self, run_id: &str) -> RunHandle {
        let context = self.cache.get_or_create(&identifier(run_id)).unwrap();
        RunHandle::lock_and_load(context, &CancelSignal::never())
            .await
            .unwrap()
    }

    pub async fn branch_events(&self, branch: &BranchToken) -> Vec<HistoryEvent> {
        self.history.inner.branch_events(branch).await.unwrap()
    }

    pub async fn current_run_id(&self) -> RunId {
        self.executions
            .get_current_execution(&NamespaceId::new(NAMESPACE), WORKFLOW)
            .await
            .unwrap()
            .run_id
    }
}

pub fn identifier(run_id: &str) -> WorkflowIdentifier {
    WorkflowIdentifier::new(NamespaceId::new(NAMESPACE), WORKFLOW, RunId::new(run_id))
}

/// Drive a decision from scheduled to completed.
pub fn complete_decision(state: &mut WorkflowMutableState) {
    let decision = state.add_decision_scheduled().unwrap();
    let started = state
        .add_decision_started(decision.schedule_id, "worker", "poll")
        .unwrap();
    state
        .add_decision_completed(decision.schedule_id, started.event_id, "worker")
        .unwrap();
}

/// A reset request against `base`, keeping events up to `reset_last_event_id`.
pub fn reset_request(
    base: &WorkflowMutableState,
    reset_last_event_id: i64,
    reset_run_id: &str,
) -> ResetRequest {
    ResetRequest {
        namespace_id: NamespaceId::new(NAMESPACE),
        workflow_id: WORKFLOW.to_string(),
        base_run_id: base.execution_info().identifier.run_id.clone(),
        base_branch_token: base.current_branch_token().clone(),
        reset_last_event_id,
        reset_last_event_version: VERSION,
        base_next_event_id: base.next_event_id(),
        reset_run_id: RunId::new(reset_run_id),
        request_id: format!("reset-req-{reset_run_id}"),
        reason: "bad deploy".to_string(),
        current_is_terminated: false,
        additional_reapply_events: Vec::new(),
    }
}

/// Names of the signals among `events`, in order.
pub fn signal_names(events: &[HistoryEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionSignaled { signal_name, .. } => {
                Some(signal_name.clone())
            }
            _ => None,
        })
        .collect()
}
