//! Lazy, page-at-a-time iteration over history.
//!
//! [`PagingIterator`] drives any page-fetching closure; [`HistoryPaginator`]
//! builds the closure that reads a branch's events within a half-open range
//! `[first_event_id, next_event_id)`, flattening batches into events.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream};
use oya_core::{CancelSignal, HistoryServiceConfig};

use crate::branch::BranchToken;
use crate::error::{Error, Result};
use crate::event::HistoryEvent;
use crate::store::{HistoryStore, PageToken, ReadHistoryBranchRequest};

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` when this was the last page.
    pub next_page_token: Option<PageToken>,
}

/// Fetches the page identified by a continuation token (`None` for the first page).
pub type PageFn<T> = Box<dyn FnMut(Option<PageToken>) -> BoxFuture<'static, Result<Page<T>>> + Send>;

/// Iterator that fetches pages lazily as items are consumed.
pub struct PagingIterator<T> {
    fetch: PageFn<T>,
    buffer: VecDeque<T>,
    next_page_token: Option<PageToken>,
    exhausted: bool,
}

impl<T: Send + 'static> PagingIterator<T> {
    /// Create an iterator over the pages produced by `fetch`.
    pub fn new(fetch: PageFn<T>) -> Self {
        Self {
            fetch,
            buffer: VecDeque::new(),
            next_page_token: None,
            exhausted: false,
        }
    }

    /// Whether another item is available, fetching pages as needed.
    ///
    /// Empty pages with a continuation token are skipped. A fetch error is
    /// returned as-is and leaves the iterator positioned at the failed page.
    pub async fn has_next(&mut self) -> Result<bool> {
        loop {
            if !self.buffer.is_empty() {
                return Ok(true);
            }
            if self.exhausted {
                return Ok(false);
            }

            let page = (self.fetch)(self.next_page_token.clone()).await?;
            self.buffer.extend(page.items);
            match page.next_page_token {
                Some(token) => self.next_page_token = Some(token),
                None => {
                    self.next_page_token = None;
                    self.exhausted = true;
                }
            }
        }
    }

    /// Return the next item, or [`Error::Exhausted`] once drained.
    pub async fn next(&mut self) -> Result<T> {
        if !self.has_next().await? {
            return Err(Error::Exhausted);
        }
        self.buffer.pop_front().ok_or(Error::Exhausted)
    }

    /// Drain into a `Stream`, ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        stream::try_unfold(self, advance)
    }
}

async fn fetch_page(
    store: Arc<dyn HistoryStore>,
    cancel: CancelSignal,
    request: ReadHistoryBranchRequest,
) -> Result<Page<HistoryEvent>> {
    cancel.check("read_history_branch")?;
    let response = store.read_history_branch(request).await?;
    tracing::trace!(
        batches = response.history.len(),
        size = response.size,
        more = response.next_page_token.is_some(),
        "Fetched history page"
    );
    let items = response
        .history
        .into_iter()
        .flat_map(|batch| batch.events)
        .collect();
    Ok(Page {
        items,
        next_page_token: response.next_page_token,
    })
}

async fn advance<T: Send + 'static>(
    mut iter: PagingIterator<T>,
) -> Result<Option<(T, PagingIterator<T>)>> {
    if iter.has_next().await? {
        let item = iter.next().await?;
        Ok(Some((item, iter)))
    } else {
        Ok(None)
    }
}

/// Builds page-fetch closures over a history store.
#[derive(Clone)]
pub struct HistoryPaginator {
    store: Arc<dyn HistoryStore>,
    shard_id: i32,
    page_size: usize,
}

impl HistoryPaginator {
    /// Create a paginator using the shard and page size from `config`.
    pub fn new(store: Arc<dyn HistoryStore>, config: &HistoryServiceConfig) -> Self {
        Self {
            store,
            shard_id: config.shard_id,
            page_size: config.history_page_size,
        }
    }

    /// Number of batches requested per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// A closure that reads events of `branch_token` in `[first_event_id, next_event_id)`.
    ///
    /// Every call checks `cancel` before touching the store.
    pub fn pagination_fn(
        &self,
        cancel: CancelSignal,
        first_event_id: i64,
        next_event_id: i64,
        branch_token: BranchToken,
    ) -> PageFn<HistoryEvent> {
        let store = Arc::clone(&self.store);
        let shard_id = self.shard_id;
        let page_size = self.page_size;

        Box::new(move |next_page_token: Option<PageToken>| {
            let request = ReadHistoryBranchRequest {
                branch_token: branch_token.clone(),
                min_event_id: first_event_id,
                max_event_id: next_event_id,
                page_size,
                next_page_token,
                shard_id,
            };

            fetch_page(Arc::clone(&store), cancel.clone(), request).boxed()
        })
    }

    /// A lazy iterator over events of `branch_token` in `[first_event_id, next_event_id)`.
    pub fn iterator(
        &self,
        cancel: CancelSignal,
        first_event_id: i64,
        next_event_id: i64,
        branch_token: BranchToken,
    ) -> PagingIterator<HistoryEvent> {
        PagingIterator::new(self.pagination_fn(cancel, first_event_id, next_event_id, branch_token))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn scripted(pages: Vec<Page<i32>>, calls: Arc<AtomicUsize>) -> PageFn<i32> {
        Box::new(move |token: Option<PageToken>| {
            let index = token
                .map(|t| String::from_utf8_lossy(t.as_bytes()).parse::<usize>().unwrap())
                .unwrap_or(0);
            calls.fetch_add(1, Ordering::SeqCst);
            let page = pages.get(index).cloned();
            async move { page.ok_or_else(|| Error::read_failed("no such page")) }.boxed()
        })
    }

    fn page(items: Vec<i32>, next: Option<usize>) -> Page<i32> {
        Page {
            items,
            next_page_token: next.map(|n| PageToken::new(n.to_string())),
        }
    }

    #[tokio::test]
    async fn fetches_lazily_and_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iter = PagingIterator::new(scripted(
            vec![page(vec![1, 2], Some(1)), page(vec![3], None)],
            Arc::clone(&calls),
        ));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(iter.next().await.unwrap(), 1);
        assert_eq!(iter.next().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(iter.next().await.unwrap(), 3);
        assert!(!iter.has_next().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skips_empty_intermediate_pages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iter = PagingIterator::new(scripted(
            vec![page(vec![], Some(1)), page(vec![], Some(2)), page(vec![9], None)],
            calls,
        ));

        assert!(iter.has_next().await.unwrap());
        assert_eq!(iter.next().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn next_after_drain_is_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iter = PagingIterator::new(scripted(vec![page(vec![], None)], calls));

        assert!(!iter.has_next().await.unwrap());
        assert_eq!(iter.next().await, Err(Error::Exhausted));
    }

    #[tokio::test]
    async fn fetch_error_surfaces_from_has_next() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iter = PagingIterator::new(scripted(vec![page(vec![1], Some(5))], calls));

        assert_eq!(iter.next().await.unwrap(), 1);
        assert!(matches!(iter.has_next().await, Err(Error::ReadFailed { .. })));
    }
}
