//! OYA History - branch-oriented event history storage.
//!
//! Every run's history lives on a branch of a history tree. A branch can be
//! forked at any node, sharing the prefix with its base. Reads are paged and
//! resumable through opaque continuation tokens.
//!
//! # Architecture
//!
//! - **Events**: [`HistoryEvent`] and the per-transaction [`History`] batch.
//! - **Store**: the [`HistoryStore`] trait, with an in-memory backend and a
//!   tracing decorator.
//! - **Paginator**: [`HistoryPaginator`] and the generic [`PagingIterator`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod branch;
pub mod error;
pub mod event;
pub mod paginator;
pub mod store;

pub use branch::{BranchToken, GcInfo};
pub use error::{Error, Result};
pub use event::{DecisionTaskFailedCause, EventAttributes, EventType, History, HistoryEvent};
pub use paginator::{HistoryPaginator, Page, PageFn, PagingIterator};
pub use store::{
    AppendHistoryNodesRequest, ForkBranchRequest, HistoryStore, InMemoryHistoryStore, PageToken,
    ReadHistoryBranchRequest, ReadHistoryBranchResponse, TracingHistoryStore,
};
