//! Branch tokens and garbage-collection info for forked branches.

use oya_core::{NamespaceId, RunId};
use serde::{Deserialize, Serialize};

/// Opaque handle to one branch of a history tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchToken(Vec<u8>);

impl BranchToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for BranchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Tags a forked branch with the run it was created for, so an abandoned
/// fork can be reclaimed later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GcInfo {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

impl GcInfo {
    /// Create gc info for a run.
    pub fn new(namespace_id: NamespaceId, workflow_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for GcInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}
