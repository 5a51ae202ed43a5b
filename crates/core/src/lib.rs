//! Core types, errors, and utilities for the OYA history service.
//!
//! Shared by the history and reset crates:
//!
//! - **Identifiers**: namespace, run and workflow identifiers plus the
//!   event-ID sentinels every history consumer agrees on.
//! - **Cancellation**: a cloneable signal checked at external call boundaries.
//! - **Configuration**: [`HistoryServiceConfig`], loadable from TOML or the
//!   environment.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod result;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{HistoryServiceConfig, DEFAULT_SYSTEM_IDENTITY};
pub use error::{Cancelled, Error};
pub use ids::{
    NamespaceId, RunId, WorkflowIdentifier, BUFFERED_EVENT_ID, EMPTY_EVENT_ID, FIRST_EVENT_ID,
    TRANSIENT_EVENT_ID,
};
pub use result::{GenericResultExt, Result};
