//! Error types for the universe core.
//!
//! All errors are strongly typed using thiserror. Every variant that refers to
//! a record carries the offending id so callers can log and alert on it.

use std::fmt;

use thiserror::Error;

use crate::ids::{NodeId, RunId};
use crate::storage::StorageError;

/// Validation errors, rejected synchronously before any write happens.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A probability outside `[0.0, 1.0]`.
    #[error("Probability {value} is out of range [0.0, 1.0]")]
    ProbabilityOutOfRange {
        /// Offending value.
        value: f64,
    },

    /// A count or interval that must be at least one.
    #[error("Field '{field}' must be positive")]
    NonPositive {
        /// Offending field.
        field: &'static str,
    },

    /// A frame whose tick does not follow the last recorded one.
    #[error("Tick {tick} is out of order for run {run_id} (expected {expected})")]
    TickOutOfOrder {
        /// Run concerned.
        run_id: RunId,
        /// Tick concerned.
        tick: u64,
        /// Next tick the log accepts.
        expected: u64,
    },

    /// A keyframe off the cadence, or a delta on it.
    #[error("Tick {tick} does not match keyframe cadence {interval} for a {frame}")]
    CadenceMismatch {
        /// Tick concerned.
        tick: u64,
        /// Keyframe interval of the run.
        interval: u64,
        /// Frame kind.
        frame: &'static str,
    },

    /// A read of a tick that was never recorded.
    #[error("Tick {tick} is out of range for run {run_id} (last recorded tick: {last_tick:?})")]
    TickOutOfRange {
        /// Run concerned.
        run_id: RunId,
        /// Tick concerned.
        tick: u64,
        /// Last recorded tick, if any.
        last_tick: Option<u64>,
    },

    /// A tick range whose start exceeds its end.
    #[error("Invalid tick range: start ({start}) must not exceed end ({end})")]
    InvalidTickRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },

    /// A scenario that cannot be compiled.
    #[error("Malformed scenario: {reason}")]
    MalformedScenario {
        /// Why.
        reason: String,
    },

    /// A comparison of fewer than two or more than four nodes.
    #[error("Comparison requires between 2 and 4 nodes (got {actual})")]
    ComparisonArity {
        /// Number of nodes given.
        actual: usize,
    },

    /// A pinned baseline missing from the compared nodes.
    #[error("Pinned baseline {node_id} is not among the compared nodes")]
    BaselineNotInSet {
        /// Node concerned.
        node_id: NodeId,
    },

    /// A configuration value out of bounds.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Why.
        reason: String,
    },

    /// A NaN or infinite number.
    #[error("Non-finite value in field '{field}'")]
    NonFinite {
        /// Offending field.
        field: String,
    },
}

/// Kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A node in the universe map.
    Node,
    /// A run.
    Run,
    /// A run's telemetry log.
    Telemetry,
    /// A persistent data directory.
    DataDir,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Run => write!(f, "run"),
            Self::Telemetry => write!(f, "telemetry"),
            Self::DataDir => write!(f, "data directory"),
        }
    }
}

/// Coarse classification used by transport layers to choose a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or out-of-project record.
    NotFound,
    /// Concurrent change or invalid state transition.
    Conflict,
    /// Bad input.
    Validation,
    /// Comparison inputs are not ready.
    NotComparableYet,
    /// Corrupt or inconsistent stored data.
    DataIntegrity,
    /// A core invariant would have been broken.
    InvariantViolation,
    /// Capacity or availability problem; may succeed later.
    Unavailable,
    /// Anything else.
    Internal,
}

/// Top-level error type for the universe core.
#[derive(Debug, Error)]
pub enum UniverseError {
    /// The record does not exist or belongs to another project.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of record.
        resource: ResourceKind,
        /// Record id.
        id: String,
    },

    /// The request raced or contradicts the record's current state.
    #[error("Conflict on {resource} {id}: {reason}")]
    Conflict {
        /// Kind of record.
        resource: ResourceKind,
        /// Record id.
        id: String,
        /// Why.
        reason: String,
    },

    /// Append to a terminal run, or any other broken core invariant.
    #[error("Invariant violation on run {run_id}: {reason}")]
    InvariantViolation {
        /// Run concerned.
        run_id: RunId,
        /// Why.
        reason: String,
    },

    /// Input rejected before any write.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A compared node has no terminal run with telemetry.
    #[error("Node {node_id} is not comparable yet: {reason}")]
    NotComparableYet {
        /// Node concerned.
        node_id: NodeId,
        /// Why.
        reason: String,
    },

    /// Stored bytes failed to decode or disagree with their index.
    #[error("Data integrity error at {location}: {message}")]
    DataIntegrity {
        /// Log or file concerned.
        location: String,
        /// Details.
        message: String,
    },

    /// The run queue has no free slot.
    #[error("Run queue is full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// A wait on a run gave up.
    #[error("Timed out after {duration_ms}ms waiting for run {run_id}")]
    Timeout {
        /// Run concerned.
        run_id: RunId,
        /// Time waited, in milliseconds.
        duration_ms: u64,
    },

    /// The worker pool has shut down.
    #[error("Worker pool disconnected: {component}")]
    Disconnected {
        /// Component that went away.
        component: &'static str,
    },

    /// A storage backend failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Details.
        message: String,
    },

    /// A bug or an unexpected failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Details.
        message: String,
    },
}

impl UniverseError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// `NotFound` for a node.
    #[must_use]
    pub fn node_not_found(id: NodeId) -> Self {
        Self::NotFound {
            resource: ResourceKind::Node,
            id: id.to_string(),
        }
    }

    /// `NotFound` for a run.
    #[must_use]
    pub fn run_not_found(id: RunId) -> Self {
        Self::NotFound {
            resource: ResourceKind::Run,
            id: id.to_string(),
        }
    }

    /// Returns the coarse error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotComparableYet { .. } => ErrorKind::NotComparableYet,
            Self::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            Self::QueueFull { .. } | Self::Timeout { .. } | Self::Disconnected { .. } => {
                ErrorKind::Unavailable
            }
            Self::Storage { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error must be surfaced as a server fault and alerted on.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. } | Self::DataIntegrity { .. })
    }

    /// Returns true if the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::NotComparableYet { .. }
                | Self::QueueFull { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<StorageError> for UniverseError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NodeNotFound(id) => Self::node_not_found(id),
            StorageError::RunNotFound(id) => Self::run_not_found(id),
            StorageError::VersionConflict {
                resource,
                id,
                expected,
                actual,
            } => Self::Conflict {
                resource,
                id,
                reason: format!("version mismatch (expected {expected}, found {actual})"),
            },
            StorageError::DuplicateKey(id) => Self::Conflict {
                resource: ResourceKind::Node,
                id,
                reason: "record already exists".to_string(),
            },
            StorageError::Corrupted { location, message } => {
                Self::DataIntegrity { location, message }
            }
            StorageError::Finalized { run_id, reason } => Self::InvariantViolation {
                run_id,
                reason: format!("telemetry log is finalized: {reason}"),
            },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for core operations.
pub type UniverseResult<T> = Result<T, UniverseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_probability() {
        let err = ValidationError::ProbabilityOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_tick_out_of_order_message() {
        let run_id = RunId::new();
        let err = ValidationError::TickOutOfOrder {
            run_id,
            tick: 3,
            expected: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains(&run_id.to_string()));
        assert!(msg.contains("expected 5"));
    }

    #[test]
    fn test_not_found_carries_id() {
        let id = NodeId::new();
        let err = UniverseError::node_not_found(id);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains(&id.to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invariant_violation_is_fatal_not_retryable() {
        let err = UniverseError::InvariantViolation {
            run_id: RunId::new(),
            reason: "append after terminal".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn test_retryable_kinds() {
        let conflict = UniverseError::Conflict {
            resource: ResourceKind::Node,
            id: "n".to_string(),
            reason: "version".to_string(),
        };
        assert!(conflict.is_retryable());

        let not_yet = UniverseError::NotComparableYet {
            node_id: NodeId::new(),
            reason: "run still running".to_string(),
        };
        assert!(not_yet.is_retryable());

        let validation: UniverseError = ValidationError::NonPositive { field: "seed" }.into();
        assert!(validation.is_validation());
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_storage_version_conflict_maps_to_conflict() {
        let err: UniverseError = StorageError::VersionConflict {
            resource: ResourceKind::Node,
            id: "abc".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("expected 1"));
    }

    #[test]
    fn test_storage_corruption_maps_to_data_integrity() {
        let err: UniverseError = StorageError::Corrupted {
            location: "mem://run".to_string(),
            message: "CRC mismatch".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
        assert!(err.is_fatal());
    }
}
