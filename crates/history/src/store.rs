//! History store trait and implementations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use oya_core::FIRST_EVENT_ID;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::branch::BranchToken;
use crate::error::{Error, Result};
use crate::event::{History, HistoryEvent};

/// Continuation token returned by paged reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(Vec<u8>);

impl PageToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Request to fork a new branch off an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkBranchRequest {
    /// Branch to fork from.
    pub fork_branch_token: BranchToken,
    /// First node (event ID) that is NOT shared with the base branch.
    pub fork_node_id: i64,
    /// Garbage-collection key for the new branch.
    pub info: String,
    pub shard_id: i32,
}

/// Request for one page of a branch's history.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadHistoryBranchRequest {
    pub branch_token: BranchToken,
    /// Inclusive lower bound.
    pub min_event_id: i64,
    /// Exclusive upper bound.
    pub max_event_id: i64,
    /// Maximum number of batches returned.
    pub page_size: usize,
    pub next_page_token: Option<PageToken>,
    pub shard_id: i32,
}

/// One page of history batches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadHistoryBranchResponse {
    pub history: Vec<History>,
    /// `None` once the range is exhausted.
    pub next_page_token: Option<PageToken>,
    /// Encoded size of the returned batches in bytes.
    pub size: i64,
}

/// Request to append one batch to a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendHistoryNodesRequest {
    pub branch_token: BranchToken,
    pub events: Vec<HistoryEvent>,
    pub shard_id: i32,
}

/// Trait for branch-oriented, append-only history storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an empty branch rooted in a new tree.
    async fn new_branch(&self, shard_id: i32) -> Result<BranchToken>;

    /// Append a batch; returns its encoded size in bytes.
    async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<i64>;

    /// Fork a branch sharing every node before `fork_node_id` with the base.
    async fn fork_branch(&self, request: ForkBranchRequest) -> Result<BranchToken>;

    /// Read one page of batches within `[min_event_id, max_event_id)`.
    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse>;
}

#[derive(Default)]
struct BranchTree {
    branches: HashMap<BranchToken, Vec<History>>,
    gc_infos: HashSet<String>,
}

/// In-memory history store.
///
/// Forked branches copy the shared prefix, which keeps the base branch
/// untouched by anything appended to the fork.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    tree: RwLock<BranchTree>,
}

impl InMemoryHistoryStore {
    /// Create a new in-memory history store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory history store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All events of a branch, in order.
    pub async fn branch_events(&self, branch_token: &BranchToken) -> Result<Vec<HistoryEvent>> {
        let tree = self.tree.read().await;
        let batches = tree
            .branches
            .get(branch_token)
            .ok_or_else(|| Error::branch_not_found(branch_token.to_string()))?;
        Ok(batches.iter().flat_map(|b| b.events.iter().cloned()).collect())
    }

    /// Number of branches held.
    pub async fn branch_count(&self) -> usize {
        self.tree.read().await.branches.len()
    }
}

fn next_event_id(batches: &[History]) -> i64 {
    batches
        .last()
        .and_then(History::last_event_id)
        .map_or(FIRST_EVENT_ID, |id| id.saturating_add(1))
}

fn parse_page_token(token: Option<&PageToken>) -> Result<usize> {
    match token {
        None => Ok(0),
        Some(token) => std::str::from_utf8(token.as_bytes())
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| Error::invalid_page_token("not an offset issued by this store")),
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn new_branch(&self, shard_id: i32) -> Result<BranchToken> {
        let token = BranchToken::new(Ulid::new().to_string());
        self.tree
            .write()
            .await
            .branches
            .insert(token.clone(), Vec::new());
        tracing::trace!(shard_id, branch = %token, "Created history branch");
        Ok(token)
    }

    async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<i64> {
        let mut tree = self.tree.write().await;
        let batches = tree
            .branches
            .get_mut(&request.branch_token)
            .ok_or_else(|| Error::branch_not_found(request.branch_token.to_string()))?;

        let mut expected = next_event_id(batches);
        for event in &request.events {
            if event.event_id != expected {
                return Err(Error::append_rejected(format!(
                    "expected event {expected}, got {}",
                    event.event_id
                )));
            }
            expected = expected.saturating_add(1);
        }
        if request.events.is_empty() {
            return Err(Error::append_rejected("empty batch"));
        }

        let batch = History::new(request.events);
        let size = batch.byte_size()?;
        batches.push(batch);
        Ok(size)
    }

    async fn fork_branch(&self, request: ForkBranchRequest) -> Result<BranchToken> {
        let mut tree = self.tree.write().await;
        let base = tree
            .branches
            .get(&request.fork_branch_token)
            .ok_or_else(|| Error::branch_not_found(request.fork_branch_token.to_string()))?;

        let base_next = next_event_id(base);
        if request.fork_node_id <= FIRST_EVENT_ID || request.fork_node_id > base_next {
            return Err(Error::invalid_fork_point(
                request.fork_node_id,
                format!("must lie in ({FIRST_EVENT_ID}, {base_next}]"),
            ));
        }

        let prefix: Vec<History> = base
            .iter()
            .filter_map(|batch| {
                let events: Vec<HistoryEvent> = batch
                    .events
                    .iter()
                    .filter(|e| e.event_id < request.fork_node_id)
                    .cloned()
                    .collect();
                (!events.is_empty()).then(|| History::new(events))
            })
            .collect();

        if !tree.gc_infos.insert(request.info.clone()) {
            return Err(Error::duplicate_gc_info(request.info));
        }

        let token = BranchToken::new(Ulid::new().to_string());
        tree.branches.insert(token.clone(), prefix);
        Ok(token)
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        if request.min_event_id < FIRST_EVENT_ID || request.min_event_id >= request.max_event_id {
            return Err(Error::InvalidRange {
                min_event_id: request.min_event_id,
                max_event_id: request.max_event_id,
            });
        }
        if request.page_size == 0 {
            return Err(Error::read_failed("page size must be positive"));
        }
        let offset = parse_page_token(request.next_page_token.as_ref())?;

        let tree = self.tree.read().await;
        let batches = tree
            .branches
            .get(&request.branch_token)
            .ok_or_else(|| Error::branch_not_found(request.branch_token.to_string()))?;

        let in_range: Vec<History> = batches
            .iter()
            .filter_map(|batch| {
                let events: Vec<HistoryEvent> = batch
                    .events
                    .iter()
                    .filter(|e| {
                        e.event_id >= request.min_event_id && e.event_id < request.max_event_id
                    })
                    .cloned()
                    .collect();
                (!events.is_empty()).then(|| History::new(events))
            })
            .collect();

        if offset > in_range.len() {
            return Err(Error::invalid_page_token("offset beyond range"));
        }

        let history: Vec<History> = in_range
            .iter()
            .skip(offset)
            .take(request.page_size)
            .cloned()
            .collect();
        let consumed = offset.saturating_add(history.len());
        let next_page_token =
            (consumed < in_range.len()).then(|| PageToken::new(consumed.to_string()));

        let mut size: i64 = 0;
        for batch in &history {
            size = size.saturating_add(batch.byte_size()?);
        }

        Ok(ReadHistoryBranchResponse {
            history,
            next_page_token,
            size,
        })
    }
}

/// A wrapper that adds tracing to a history store.
pub struct TracingHistoryStore<S: HistoryStore> {
    inner: S,
}

impl<S: HistoryStore> TracingHistoryStore<S> {
    /// Create a new tracing history store.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: HistoryStore> HistoryStore for TracingHistoryStore<S> {
    async fn new_branch(&self, shard_id: i32) -> Result<BranchToken> {
        tracing::debug!(shard_id, "Creating history branch");
        self.inner.new_branch(shard_id).await
    }

    async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<i64> {
        tracing::debug!(
            branch = %request.branch_token,
            events = request.events.len(),
            first_event_id = ?request.events.first().map(|e| e.event_id),
            "Appending history batch"
        );
        self.inner.append_history_nodes(request).await
    }

    async fn fork_branch(&self, request: ForkBranchRequest) -> Result<BranchToken> {
        tracing::debug!(
            base = %request.fork_branch_token,
            fork_node_id = request.fork_node_id,
            info = %request.info,
            "Forking history branch"
        );
        let result = self.inner.fork_branch(request).await;
        match &result {
            Ok(token) => tracing::trace!(branch = %token, "Branch forked"),
            Err(e) => tracing::warn!(error = %e, "Branch fork rejected"),
        }
        result
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        tracing::debug!(
            branch = %request.branch_token,
            min_event_id = request.min_event_id,
            max_event_id = request.max_event_id,
            continued = request.next_page_token.is_some(),
            "Reading history page"
        );
        self.inner.read_history_branch(request).await
    }
}
