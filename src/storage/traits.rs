//! Abstract storage traits for the universe core.
//!
//! These traits define the contract that storage backends must implement.
//! Two backends ship with the crate:
//! - In-memory, for embedding and tests
//! - Persistent (feature `persistent`), WAL journal plus per-run log files

use thiserror::Error;

use crate::error::ResourceKind;
use crate::ids::{NodeId, ProjectId, RunId};
use crate::node::Node;
use crate::run::Run;
use crate::telemetry::TelemetryIndex;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// No telemetry log exists for the run.
    #[error("Telemetry log not found for run {0}")]
    TelemetryNotFound(RunId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Optimistic concurrency check failed.
    #[error("Version conflict on {resource} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Kind of record.
        resource: ResourceKind,
        /// Record id.
        id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The run's telemetry index is final; the log accepts no further writes.
    #[error("Telemetry log for run {run_id} is finalized: {reason}")]
    Finalized {
        /// Run whose log is final.
        run_id: RunId,
        /// Write that was refused.
        reason: String,
    },

    /// Stored bytes failed a checksum or framing check.
    #[error("Corrupted data at {location}: {message}")]
    Corrupted {
        /// Log or file concerned.
        location: String,
        /// What failed to check out.
        message: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Storage trait for universe map nodes.
///
/// Nodes are never updated in place. The only mutation is the parent's
/// `child_count`, and it happens inside [`NodeStore::insert_child`].
pub trait NodeStore: Send + Sync {
    /// Insert a root node. Returns error if the ID already exists.
    fn insert_root(&self, node: Node) -> Result<(), StorageError>;

    /// Atomically insert `child` and increment its parent's `child_count`.
    ///
    /// The parent's stored `version` must equal `expected_parent_version`,
    /// otherwise nothing is written and `VersionConflict` is returned.
    /// On success the updated parent is returned.
    fn insert_child(&self, child: Node, expected_parent_version: u64) -> Result<Node, StorageError>;

    /// Get a node by ID.
    fn get(&self, id: NodeId) -> Result<Option<Node>, StorageError>;

    /// All nodes of a project, oldest first.
    fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Node>, StorageError>;
}

/// Storage trait for runs.
pub trait RunStore: Send + Sync {
    /// Insert a new run. Returns error if the ID already exists.
    fn insert(&self, run: Run) -> Result<(), StorageError>;

    /// Get a run by ID.
    fn get(&self, id: RunId) -> Result<Option<Run>, StorageError>;

    /// Replace a run if its stored version equals `expected_version`.
    ///
    /// The stored copy gets `version = expected_version + 1` and is returned.
    fn update(&self, run: Run, expected_version: u64) -> Result<Run, StorageError>;

    /// All runs of a project, oldest first.
    fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Run>, StorageError>;
}

/// Storage trait for per-run append-only telemetry logs and their indexes.
///
/// Offsets are logical: byte 0 is the first byte of the first frame, whatever
/// header the backend writes in front of it.
pub trait TelemetryLogStore: Send + Sync {
    /// Create an empty log for a run and return its location.
    fn create(&self, run_id: RunId) -> Result<String, StorageError>;

    /// Append framed bytes and publish the index that covers them.
    ///
    /// `index.storage_ref.byte_size` must equal the log length after the
    /// append; readers never observe one without the other.
    fn append(&self, run_id: RunId, bytes: &[u8], index: TelemetryIndex) -> Result<(), StorageError>;

    /// Replace the published index without writing log bytes (used to finalize).
    fn publish_index(&self, index: TelemetryIndex) -> Result<(), StorageError>;

    /// Latest published index, if the run has a log.
    fn index(&self, run_id: RunId) -> Result<Option<TelemetryIndex>, StorageError>;

    /// Read bytes `[start, end)` of a run's log.
    fn read_range(&self, run_id: RunId, start: u64, end: u64) -> Result<Vec<u8>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_node_store_object_safe(_: &dyn NodeStore) {}
    fn _assert_run_store_object_safe(_: &dyn RunStore) {}
    fn _assert_telemetry_store_object_safe(_: &dyn TelemetryLogStore) {}

    #[test]
    fn test_storage_error_display() {
        let id = NodeId::new();
        let err = StorageError::NodeNotFound(id);
        assert!(err.to_string().contains("Node not found"));
        assert!(err.to_string().contains(&id.to_string()));

        let err = StorageError::VersionConflict {
            resource: ResourceKind::Node,
            id: "n1".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(err.to_string().contains("expected 3, found 4"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
