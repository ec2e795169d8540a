//! # universe-core - branching simulation state with replayable telemetry
//!
//! The core keeps a map of "what-if" branches and the recorded history of the
//! simulation run behind each branch.
//!
//! ## Core Concepts
//!
//! - **Node**: an immutable branch point; children are created only by forking
//! - **Run**: the single execution attempt bound to a node, with a lifecycle
//!   state machine (`queued -> starting -> running -> succeeded|failed|cancelled`)
//! - **Telemetry**: an append-only log of keyframes and deltas per run, plus an
//!   index for O(log n) seeks
//! - **Replay / Comparison**: read-only views over recorded telemetry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use universe_core::{ForkRequest, ProjectId, RequestContext, Universe, UniverseConfig};
//!
//! let universe = Universe::in_memory(Arc::new(MyExecutor), UniverseConfig::default())?;
//! let ctx = RequestContext::new(ProjectId::new());
//!
//! let root = universe.fork(&ctx, ForkRequest::root().with_label("today"))?;
//! let (node, run) = universe.execute_scenario(
//!     &ctx,
//!     ForkRequest::child_of(root.node_id).with_scenario(compiled),
//!     42,
//!     100,
//! )?;
//! let finished = universe.start(&ctx, run.run_id)?.join()?;
//! let slice = universe.get_slice(&ctx, finished.run_id, 47)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod confidence;
pub mod context;
pub mod error;
pub mod ids;
pub mod node;
pub mod run;
pub mod scenario;

// Storage and telemetry
pub mod storage;
pub mod telemetry;

// Services
pub mod compare;
pub mod config;
pub mod fork;
pub mod replay;
pub mod scheduler;
pub mod universe;

// Re-export primary types at crate root for convenience
pub use compare::{
    CompareRequest, ComparisonEngine, ComparisonReport, KeyDifference, NodeOutcome,
    Recommendation, RecommendationBasis,
};
pub use confidence::{ConfidenceLevel, Probability};
pub use config::{SchedulerConfig, UniverseConfig};
pub use context::RequestContext;
pub use error::{ErrorKind, ResourceKind, UniverseError, UniverseResult, ValidationError};
pub use fork::{ForkRequest, ForkService};
pub use ids::{AgentId, NodeId, ProjectId, RunId};
pub use node::{Edge, EdgeVisibility, Node, ShowAllEdges, UniverseMap};
pub use replay::{AuditView, ReplayService, TelemetrySlice, TickRange};
pub use run::{Run, RunConfig, RunMetadata, RunStatus};
pub use scenario::{CandidateScenario, CompiledScenario, ScenarioKind};
pub use scheduler::{ExecutorError, RunContext, RunHandle, RunScheduler, TickExecutor};
pub use storage::{
    InMemoryNodeStore, InMemoryRunStore, InMemoryStores, InMemoryTelemetryStore, NodeStore,
    RunStore, StorageError, TelemetryLogStore,
};
pub use telemetry::{
    AgentState, AgentUpdate, EventOccurrence, EventSignal, SimulationState, TelemetryDelta,
    TelemetryFrame, TelemetryIndex, TelemetryKeyframe, TelemetryRecorder, TelemetrySummary,
    TickUpdate,
};
pub use universe::Universe;
