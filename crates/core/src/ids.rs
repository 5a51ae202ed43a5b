//! Identifiers shared across the history service.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// ID of the first event of every run's history.
pub const FIRST_EVENT_ID: i64 = 1;

/// Started ID of an activity or decision that has not been started.
pub const EMPTY_EVENT_ID: i64 = -23;

/// Event ID carried by events sitting in the buffer, not yet flushed.
pub const BUFFERED_EVENT_ID: i64 = -123;

/// Started ID of an activity started under a retry policy; never persisted.
pub const TRANSIENT_EVENT_ID: i64 = -124;

/// Identifier of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Create a namespace ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the namespace ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Create a run ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, unique run ID.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Get the run ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one execution instance: namespace, workflow ID and run ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentifier {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

impl WorkflowIdentifier {
    /// Create a new workflow identifier.
    pub fn new(namespace_id: NamespaceId, workflow_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
        }
    }

    /// Same namespace and workflow, different run.
    #[must_use]
    pub fn with_run_id(&self, run_id: RunId) -> Self {
        Self {
            namespace_id: self.namespace_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id,
        }
    }
}

impl std::fmt::Display for WorkflowIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}
