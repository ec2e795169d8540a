//! Runs and their lifecycle state machine.
//!
//! ```text
//! queued ──> starting ──> running ──> succeeded
//!   │           │            ├──────> failed
//!   │           ├──> failed  └──────> cancelled
//!   └───────────┴──> cancelled
//! ```
//!
//! Terminal states never transition further.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{NodeId, ProjectId, RunId};
use crate::scenario::CompiledScenario;

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for a worker.
    Queued,
    /// Claimed by a worker, initial state being recorded.
    Starting,
    /// Executing ticks.
    Running,
    /// All ticks executed.
    Succeeded,
    /// Stopped on an unrecoverable execution error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the telemetry recorder may append for a run in this state.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => matches!(target, Self::Starting | Self::Cancelled),
            Self::Starting => matches!(target, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Cancelled),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Parameters for enqueuing a run against a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Node the run executes.
    pub node_id: NodeId,
    /// Seed handed to the executor.
    pub seed: u64,
    /// Ticks to execute after the initial keyframe.
    pub total_ticks: u64,
    /// Keyframe cadence; falls back to the scheduler default when absent.
    pub keyframe_interval: Option<u64>,
}

impl RunConfig {
    /// A run of `total_ticks` ticks at the default keyframe cadence.
    #[must_use]
    pub const fn new(node_id: NodeId, seed: u64, total_ticks: u64) -> Self {
        Self {
            node_id,
            seed,
            total_ticks,
            keyframe_interval: None,
        }
    }

    /// Sets the keyframe cadence.
    #[must_use]
    pub const fn with_keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframe_interval = Some(interval);
        self
    }

    /// Validates numeric parameters.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::NonPositive` for a zero seed, tick count or interval.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.seed == 0 {
            return Err(ValidationError::NonPositive { field: "seed" });
        }
        if self.total_ticks == 0 {
            return Err(ValidationError::NonPositive {
                field: "total_ticks",
            });
        }
        if self.keyframe_interval == Some(0) {
            return Err(ValidationError::NonPositive {
                field: "keyframe_interval",
            });
        }
        Ok(())
    }
}

/// One execution attempt bound to exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id, allocated with its node.
    pub run_id: RunId,
    /// Owning project.
    pub project_id: ProjectId,
    /// The one node this run executes.
    pub node_id: NodeId,
    /// Lifecycle state.
    pub status: RunStatus,
    /// Seed handed to the executor.
    pub seed: u64,
    /// Tick budget.
    pub total_ticks: u64,
    /// Last tick fully recorded.
    pub current_tick: u64,
    /// Ticks between keyframes.
    pub keyframe_interval: u64,
    /// Compiled scenario copied from the node at enqueue time.
    pub scenario: Option<CompiledScenario>,
    /// Failure reason for `failed` runs.
    pub error: Option<String>,
    /// Optimistic-concurrency guard, bumped on every update.
    pub version: u64,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Time a worker claimed the run.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Returns a copy advanced to `target`, with timestamps filled in.
    ///
    /// Returns `None` if the state machine forbids the transition.
    #[must_use]
    pub fn transitioned(&self, target: RunStatus) -> Option<Self> {
        if !self.status.can_transition_to(target) {
            return None;
        }
        let mut next = self.clone();
        next.status = target;
        let now = Utc::now();
        if target == RunStatus::Starting {
            next.started_at = Some(now);
        }
        if target.is_terminal() {
            next.completed_at = Some(now);
        }
        Some(next)
    }

    /// Metadata view exposed to the audit collaborator.
    #[must_use]
    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            run_id: self.run_id,
            node_id: self.node_id,
            status: self.status,
            seed: self.seed,
            total_ticks: self.total_ticks,
            current_tick: self.current_tick,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only run metadata: seed, tick budget, timestamps and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// See [`Run::run_id`].
    pub run_id: RunId,
    /// See [`Run::node_id`].
    pub node_id: NodeId,
    /// See [`Run::status`].
    pub status: RunStatus,
    /// See [`Run::seed`].
    pub seed: u64,
    /// See [`Run::total_ticks`].
    pub total_ticks: u64,
    /// See [`Run::current_tick`].
    pub current_tick: u64,
    /// See [`Run::created_at`].
    pub created_at: DateTime<Utc>,
    /// See [`Run::started_at`].
    pub started_at: Option<DateTime<Utc>>,
    /// See [`Run::completed_at`].
    pub completed_at: Option<DateTime<Utc>>,
}
