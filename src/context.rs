//! Request-scoped context passed into every core call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::ProjectId;

/// Explicit per-request scope.
///
/// The core serves many concurrent callers, so nothing about "the current
/// project" is ever held in ambient state: each operation receives the
/// context and checks records against `project_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Project all records touched by the request must belong to.
    pub project_id: ProjectId,
    /// Correlation id for logs.
    pub request_id: Uuid,
}

impl RequestContext {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            request_id: Uuid::new_v4(),
        }
    }

    /// Creates a context reusing a caller-supplied correlation id.
    #[must_use]
    pub const fn with_request_id(project_id: ProjectId, request_id: Uuid) -> Self {
        Self {
            project_id,
            request_id,
        }
    }

    /// Returns true if a record owned by `project_id` is visible to this request.
    #[must_use]
    pub fn owns(&self, project_id: ProjectId) -> bool {
        self.project_id == project_id
    }
}
