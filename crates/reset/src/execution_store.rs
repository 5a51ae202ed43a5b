//! Execution records and the per-workflow current-run pointer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use oya_core::{NamespaceId, RunId, WorkflowIdentifier};
use tokio::sync::RwLock;

use crate::context::{ContextError, CreateMode};
use crate::state::{ExecutionStatus, WorkflowSnapshot};

/// The workflow's current run as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentExecution {
    pub run_id: RunId,
    pub last_write_version: i64,
    pub status: ExecutionStatus,
}

impl CurrentExecution {
    fn of(snapshot: &WorkflowSnapshot) -> Self {
        Self {
            run_id: snapshot.execution_info.identifier.run_id.clone(),
            last_write_version: snapshot.last_write_version,
            status: snapshot.execution_info.status,
        }
    }
}

/// Request to create a run record.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateExecutionRequest {
    pub mode: CreateMode,
    /// Expected current run for [`CreateMode::ContinueAsNew`].
    pub prev_run_id: Option<RunId>,
    pub prev_last_write_version: i64,
    pub snapshot: WorkflowSnapshot,
}

/// Request to update a run and install a new current run atomically.
///
/// The write is gated on the updated run still being the workflow's current
/// run and its stored next event ID still equalling `condition`. The last
/// write version is not compared: every write to a run advances its next
/// event ID, so the event ID condition already rejects a stale run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWithNewRequest {
    /// Next event ID the updated run had when it was loaded.
    pub condition: i64,
    pub snapshot: WorkflowSnapshot,
    pub new_snapshot: WorkflowSnapshot,
}

/// Trait for execution record storage.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_workflow_execution(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> Result<WorkflowSnapshot, ContextError>;

    async fn get_current_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &str,
    ) -> Result<CurrentExecution, ContextError>;

    async fn create_workflow_execution(
        &self,
        request: CreateExecutionRequest,
    ) -> Result<(), ContextError>;

    async fn update_workflow_execution_with_new(
        &self,
        request: UpdateWithNewRequest,
    ) -> Result<(), ContextError>;
}

type WorkflowKey = (NamespaceId, String);

fn workflow_key(identifier: &WorkflowIdentifier) -> WorkflowKey {
    (identifier.namespace_id.clone(), identifier.workflow_id.clone())
}

#[derive(Default)]
struct Executions {
    runs: HashMap<WorkflowIdentifier, WorkflowSnapshot>,
    current: HashMap<WorkflowKey, CurrentExecution>,
}

/// In-memory execution store with optimistic preconditions.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<Executions>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of run records held.
    pub async fn run_count(&self) -> usize {
        self.executions.read().await.runs.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_workflow_execution(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> Result<WorkflowSnapshot, ContextError> {
        self.executions
            .read()
            .await
            .runs
            .get(identifier)
            .cloned()
            .ok_or_else(|| ContextError::not_found(identifier))
    }

    async fn get_current_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &str,
    ) -> Result<CurrentExecution, ContextError> {
        self.executions
            .read()
            .await
            .current
            .get(&(namespace_id.clone(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| ContextError::NotFound {
                identifier: format!("{namespace_id}/{workflow_id}"),
            })
    }

    async fn create_workflow_execution(
        &self,
        request: CreateExecutionRequest,
    ) -> Result<(), ContextError> {
        let identifier = request.snapshot.execution_info.identifier.clone();
        let key = workflow_key(&identifier);
        let mut executions = self.executions.write().await;

        if executions.runs.contains_key(&identifier) {
            return Err(ContextError::failed(format!("run {identifier} already exists")));
        }

        match (request.mode, executions.current.get(&key)) {
            (CreateMode::BrandNew, None) => {}
            (CreateMode::BrandNew, Some(current)) => {
                return Err(ContextError::conflict(format!(
                    "workflow already has current run {}",
                    current.run_id
                )));
            }
            (CreateMode::ContinueAsNew, Some(current))
                if request.prev_run_id.as_ref() == Some(&current.run_id)
                    && current.last_write_version == request.prev_last_write_version => {}
            (CreateMode::ContinueAsNew, current) => {
                return Err(ContextError::conflict(format!(
                    "expected current run {:?} at version {}, found {:?}",
                    request.prev_run_id,
                    request.prev_last_write_version,
                    current.map(|c| (&c.run_id, c.last_write_version))
                )));
            }
        }

        executions
            .current
            .insert(key, CurrentExecution::of(&request.snapshot));
        executions.runs.insert(identifier, request.snapshot);
        Ok(())
    }

    async fn update_workflow_execution_with_new(
        &self,
        request: UpdateWithNewRequest,
    ) -> Result<(), ContextError> {
        let identifier = request.snapshot.execution_info.identifier.clone();
        let new_identifier = request.new_snapshot.execution_info.identifier.clone();
        let key = workflow_key(&identifier);
        let mut executions = self.executions.write().await;

        let stored = executions
            .runs
            .get(&identifier)
            .ok_or_else(|| ContextError::not_found(&identifier))?;
        if stored.next_event_id != request.condition {
            return Err(ContextError::conflict(format!(
                "run {identifier} moved to event {}, expected {}",
                stored.next_event_id, request.condition
            )));
        }
        match executions.current.get(&key) {
            Some(current) if current.run_id == identifier.run_id => {}
            current => {
                return Err(ContextError::conflict(format!(
                    "run {identifier} is not current (current: {:?})",
                    current.map(|c| &c.run_id)
                )));
            }
        }
        if workflow_key(&new_identifier) != key {
            return Err(ContextError::failed("new run belongs to another workflow"));
        }
        if executions.runs.contains_key(&new_identifier) {
            return Err(ContextError::failed(format!(
                "run {new_identifier} already exists"
            )));
        }

        executions
            .current
            .insert(key, CurrentExecution::of(&request.new_snapshot));
        executions.runs.insert(identifier, request.snapshot);
        executions
            .runs
            .insert(new_identifier, request.new_snapshot);
        Ok(())
    }
}
