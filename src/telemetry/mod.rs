//! Telemetry: frames, the per-run index, event derivation and the recorder.
//!
//! A run's log is a sequence of CRC-framed [`TelemetryFrame`]s. Tick 0 is the
//! initial keyframe; every tick divisible by the keyframe interval is a
//! keyframe and every other tick a delta.

mod events;
mod index;
mod recorder;
mod types;

pub use events::{EventOccurrence, EventTracker};
pub use index::{StorageRef, TelemetryIndex, TelemetrySummary};
pub use recorder::TelemetryRecorder;
pub use types::{
    AgentState, AgentUpdate, EventSignal, SimulationState, TelemetryDelta, TelemetryFrame,
    TelemetryKeyframe, TickUpdate,
};

/// Returns true if `tick` must be recorded as a keyframe.
#[must_use]
pub const fn is_keyframe_tick(tick: u64, interval: u64) -> bool {
    tick % interval == 0
}
