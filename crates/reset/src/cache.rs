//! Cache of run contexts.
//!
//! A run's lock lives in its context, so every caller that wants to lock a
//! run must obtain the context through the same cache. A context evicted
//! while still referenced (for example by a locked [`RunHandle`]) is handed
//! out again instead of being replaced, so a run never has two locks.
//!
//! [`RunHandle`]: crate::context::RunHandle

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use oya_core::{HistoryServiceConfig, WorkflowIdentifier};
use oya_history::HistoryStore;

use crate::context::{ContextError, ExecutionContext, RunContext};
use crate::execution_store::ExecutionStore;

/// Source of shared run contexts.
pub trait RunCache: Send + Sync {
    /// The cached context for a run, created on first use.
    fn get_or_create(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> Result<Arc<dyn RunContext>, ContextError>;

    /// Cache `context` unless its run is already cached; returns the cached one.
    fn put_if_absent(&self, context: Arc<dyn RunContext>) -> Arc<dyn RunContext>;

    /// A fresh context that is not cached.
    fn new_context(&self, identifier: WorkflowIdentifier) -> Arc<dyn RunContext>;
}

/// [`RunCache`] building [`ExecutionContext`]s, backed by a `moka` cache.
pub struct ExecutionCache {
    cache: Cache<WorkflowIdentifier, Arc<dyn RunContext>>,
    /// Every context handed out, while anything still references it.
    live: DashMap<WorkflowIdentifier, Weak<dyn RunContext>>,
    shard_id: i32,
    executions: Arc<dyn ExecutionStore>,
    history: Arc<dyn HistoryStore>,
}

impl ExecutionCache {
    pub fn new(
        config: &HistoryServiceConfig,
        executions: Arc<dyn ExecutionStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            cache: Cache::builder().max_capacity(config.cache_capacity).build(),
            live: DashMap::new(),
            shard_id: config.shard_id,
            executions,
            history,
        }
    }

    pub fn contains(&self, identifier: &WorkflowIdentifier) -> bool {
        self.cache.contains_key(identifier)
    }

    /// The live context for `identifier`, or `fresh` registered as live.
    fn adopt(
        &self,
        identifier: &WorkflowIdentifier,
        fresh: impl FnOnce() -> Arc<dyn RunContext>,
    ) -> Arc<dyn RunContext> {
        self.live.retain(|_, context| context.strong_count() > 0);
        match self.live.entry(identifier.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(context) = entry.get().upgrade() {
                    return context;
                }
                let context = fresh();
                entry.insert(Arc::downgrade(&context));
                context
            }
            Entry::Vacant(entry) => {
                let context = fresh();
                entry.insert(Arc::downgrade(&context));
                context
            }
        }
    }
}

impl RunCache for ExecutionCache {
    fn get_or_create(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> Result<Arc<dyn RunContext>, ContextError> {
        Ok(self.cache.get_with(identifier.clone(), || {
            self.adopt(identifier, || self.new_context(identifier.clone()))
        }))
    }

    fn put_if_absent(&self, context: Arc<dyn RunContext>) -> Arc<dyn RunContext> {
        let identifier = context.identifier().clone();
        self.cache
            .get_with(identifier.clone(), || self.adopt(&identifier, || context))
    }

    fn new_context(&self, identifier: WorkflowIdentifier) -> Arc<dyn RunContext> {
        Arc::new(ExecutionContext::new(
            identifier,
            self.shard_id,
            Arc::clone(&self.executions),
            Arc::clone(&self.history),
        ))
    }
}
