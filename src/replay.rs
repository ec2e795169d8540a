//! Read-only replay over recorded telemetry.
//!
//! Nothing in this module writes. Every operation takes the published index
//! of a run, seeks to the byte ranges it needs and decodes frames from there;
//! out-of-range requests fail before any bytes are read.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::{ResourceKind, UniverseError, UniverseResult, ValidationError};
use crate::ids::RunId;
use crate::run::{Run, RunMetadata};
use crate::storage::codec::{self, FrameIter};
use crate::storage::{RunStore, StorageError, TelemetryLogStore};
use crate::telemetry::{
    EventOccurrence, EventTracker, SimulationState, TelemetryDelta, TelemetryFrame,
    TelemetryIndex, TelemetryKeyframe, TelemetrySummary,
};

/// Inclusive tick range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRange {
    /// First tick.
    pub start: u64,
    /// Last tick.
    pub end: u64,
}

impl TickRange {
    /// Range from `start` to `end`, both included.
    ///
    /// # Errors
    ///
    /// `InvalidTickRange` if `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidTickRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Returns true if `tick` lies in the range.
    #[must_use]
    pub const fn contains(&self, tick: u64) -> bool {
        self.start <= tick && tick <= self.end
    }
}

/// The keyframe covering a tick plus the deltas up to and including it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySlice {
    /// The covering keyframe; empty only for an empty slice.
    pub keyframes: Vec<TelemetryKeyframe>,
    /// Deltas after the keyframe, in tick order.
    pub deltas: Vec<TelemetryDelta>,
}

impl TelemetrySlice {
    /// Exact state at the last tick of the slice.
    #[must_use]
    pub fn materialize(&self) -> SimulationState {
        let mut state = self
            .keyframes
            .last()
            .map(SimulationState::from_keyframe)
            .unwrap_or_default();
        for delta in &self.deltas {
            state.apply_delta(delta);
        }
        state
    }

    /// Hex blake3 digest of the slice content with run ids left out.
    ///
    /// Two runs fed the same seed and scenario produce equal fingerprints for
    /// every tick.
    ///
    /// # Errors
    ///
    /// Fails only if a frame cannot be serialized.
    pub fn fingerprint(&self) -> UniverseResult<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| UniverseError::internal(format!("failed to serialize slice: {e}")))?;
        for list in ["keyframes", "deltas"] {
            if let Some(frames) = value.get_mut(list).and_then(serde_json::Value::as_array_mut) {
                for frame in frames {
                    if let Some(obj) = frame.as_object_mut() {
                        obj.remove("run_id");
                    }
                }
            }
        }
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| UniverseError::internal(format!("failed to serialize slice: {e}")))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// What an auditor may see of a run as of a given tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditView {
    /// Immutable facts about the run.
    pub run: RunMetadata,
    /// Tick the view is cut at.
    pub as_of_tick: u64,
    /// Keyframe ticks recorded at or before `as_of_tick`.
    pub keyframe_ticks: Vec<u64>,
    /// Index counts as they stood at `as_of_tick`.
    pub summary: TelemetrySummary,
    /// Events with at least one tick at or before `as_of_tick`, clipped to it.
    pub events: Vec<EventOccurrence>,
}

/// Serves summaries, slices, series and events from recorded logs.
pub struct ReplayService {
    runs: Arc<dyn RunStore>,
    logs: Arc<dyn TelemetryLogStore>,
}

impl ReplayService {
    /// Creates a service reading `runs` and their telemetry `logs`.
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>, logs: Arc<dyn TelemetryLogStore>) -> Self {
        Self { runs, logs }
    }

    fn load_run(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        self.runs
            .get(run_id)?
            .filter(|run| ctx.owns(run.project_id))
            .ok_or_else(|| UniverseError::run_not_found(run_id))
    }

    fn load_index(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<TelemetryIndex> {
        self.load_run(ctx, run_id)?;
        self.logs
            .index(run_id)?
            .ok_or_else(|| UniverseError::NotFound {
                resource: ResourceKind::Telemetry,
                id: run_id.to_string(),
            })
    }

    fn check_tick(index: &TelemetryIndex, tick: u64) -> Result<(), ValidationError> {
        match index.last_tick {
            Some(last) if tick <= last => Ok(()),
            last_tick => Err(ValidationError::TickOutOfRange {
                run_id: index.run_id,
                tick,
                last_tick,
            }),
        }
    }

    fn read_frames(
        &self,
        index: &TelemetryIndex,
        start: u64,
        end: u64,
    ) -> UniverseResult<Vec<TelemetryFrame>> {
        let run_id = index.run_id;
        let bytes = self.logs.read_range(run_id, start, end)?;
        FrameIter::<TelemetryFrame>::new(&bytes)
            .map(|item| {
                item.map(|(_, frame)| frame).map_err(|e| {
                    UniverseError::from(StorageError::Corrupted {
                        location: index.storage_ref.location.clone(),
                        message: format!("undecodable frame in bytes {start}..{end}: {e}"),
                    })
                })
            })
            .collect()
    }

    /// Totals for a run. Live runs report their index as it stands.
    ///
    /// A run that never recorded anything yields an empty summary.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run is not in the caller's project.
    pub fn get_summary(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<TelemetrySummary> {
        let run = self.load_run(ctx, run_id)?;
        Ok(match self.logs.index(run_id)? {
            Some(index) => index.summary(),
            None => TelemetrySummary {
                run_id,
                total_ticks: 0,
                total_events: 0,
                total_agents: 0,
                frame_count: 0,
                finalized: run.status.is_terminal(),
            },
        })
    }

    /// The greatest keyframe at or before `tick` and the deltas after it up to
    /// and including `tick`, in order.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown run or a run without telemetry
    /// - `Validation` if `tick` was not recorded
    /// - `DataIntegrity` if the stored bytes do not decode
    pub fn get_slice(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        tick: u64,
    ) -> UniverseResult<TelemetrySlice> {
        let index = self.load_index(ctx, run_id)?;
        Self::check_tick(&index, tick)?;
        let (start, end) = index.segment_for(tick).ok_or_else(|| UniverseError::DataIntegrity {
            location: index.storage_ref.location.clone(),
            message: format!("no keyframe at or before tick {tick}"),
        })?;

        let mut slice = TelemetrySlice {
            keyframes: Vec::with_capacity(1),
            deltas: Vec::new(),
        };
        for frame in self.read_frames(&index, start, end)? {
            if frame.tick() > tick {
                break;
            }
            match frame {
                TelemetryFrame::Keyframe(k) if slice.keyframes.is_empty() => slice.keyframes.push(k),
                TelemetryFrame::Delta(d) if !slice.keyframes.is_empty() => slice.deltas.push(d),
                other => {
                    return Err(UniverseError::DataIntegrity {
                        location: index.storage_ref.location.clone(),
                        message: format!("unexpected frame at tick {} in keyframe segment", other.tick()),
                    })
                }
            }
        }
        let covered = slice
            .deltas
            .last()
            .map(|d| d.tick)
            .or_else(|| slice.keyframes.first().map(|k| k.tick));
        if covered != Some(tick) {
            return Err(UniverseError::DataIntegrity {
                location: index.storage_ref.location.clone(),
                message: format!("segment for tick {tick} ends at {covered:?}"),
            });
        }
        Ok(slice)
    }

    /// Materialized state at `tick`.
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_slice`].
    pub fn state_at(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        tick: u64,
    ) -> UniverseResult<SimulationState> {
        Ok(self.get_slice(ctx, run_id, tick)?.materialize())
    }

    /// Value of `metric_key` at every recorded tick of `range` where it is set.
    ///
    /// The range end is clipped to the last recorded tick.
    ///
    /// # Errors
    ///
    /// `Validation` if the range starts after the last recorded tick,
    /// otherwise as [`ReplayService::get_slice`].
    pub fn get_metric_series(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        metric_key: &str,
        range: TickRange,
    ) -> UniverseResult<Vec<(u64, f64)>> {
        let index = self.load_index(ctx, run_id)?;
        Self::check_tick(&index, range.start)?;
        if !index.metric_keys.contains(metric_key) {
            return Ok(Vec::new());
        }
        let Some((_, start)) = index.keyframe_at_or_before(range.start) else {
            return Ok(Vec::new());
        };
        let end = index
            .segment_for(range.end)
            .map_or(index.storage_ref.byte_size, |(_, end)| end);

        let mut series = Vec::new();
        let mut current = None;
        for frame in self.read_frames(&index, start, end)? {
            let tick = frame.tick();
            if tick > range.end {
                break;
            }
            match &frame {
                TelemetryFrame::Keyframe(k) => current = k.metrics.get(metric_key).copied(),
                TelemetryFrame::Delta(d) => {
                    if let Some(value) = d.metrics.get(metric_key) {
                        current = Some(*value);
                    }
                }
            }
            if let (true, Some(value)) = (range.contains(tick), current) {
                series.push((tick, value));
            }
        }
        Ok(series)
    }

    /// Event occurrences overlapping `range`.
    ///
    /// Occurrences still open at the range end are reported with their true
    /// end tick when the log has one, `None` otherwise.
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_metric_series`].
    pub fn get_events(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        range: TickRange,
    ) -> UniverseResult<Vec<EventOccurrence>> {
        let index = self.load_index(ctx, run_id)?;
        Self::check_tick(&index, range.start)?;
        let mut tracker = EventTracker::new();
        for frame in self.read_frames(&index, 0, index.storage_ref.byte_size)? {
            tracker.observe(&frame);
        }
        Ok(tracker
            .finish()
            .into_iter()
            .filter(|e| e.overlaps(range.start, range.end))
            .collect())
    }

    /// What existed as of `as_of_tick`: run metadata, the index prefix and the
    /// events seen so far.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown run or a run without telemetry;
    /// `Validation` if `as_of_tick` was not recorded.
    pub fn audit_view(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        as_of_tick: u64,
    ) -> UniverseResult<AuditView> {
        let run = self.load_run(ctx, run_id)?;
        let index = self.load_index(ctx, run_id)?;
        Self::check_tick(&index, as_of_tick)?;
        let end = index
            .segment_for(as_of_tick)
            .map_or(index.storage_ref.byte_size, |(_, end)| end);

        let mut prefix = TelemetryIndex::new(run_id, index.storage_ref.location.clone());
        let mut tracker = EventTracker::new();
        let bytes = self.logs.read_range(run_id, 0, end)?;
        for item in FrameIter::<TelemetryFrame>::new(&bytes) {
            let (offset, frame) = item.map_err(|e| StorageError::Corrupted {
                location: index.storage_ref.location.clone(),
                message: format!("undecodable frame before tick {as_of_tick}: {e}"),
            })?;
            if frame.tick() > as_of_tick {
                break;
            }
            let len = codec::frame_len(&bytes, offset).ok_or_else(|| UniverseError::DataIntegrity {
                location: index.storage_ref.location.clone(),
                message: format!("frame at offset {offset} has no readable length"),
            })?;
            prefix.observe(&frame, offset, len);
            tracker.observe(&frame);
        }
        let events = tracker
            .finish()
            .into_iter()
            .filter(|e| e.start_tick <= as_of_tick)
            .collect();
        let mut summary = prefix.summary();
        summary.finalized = index.finalized;

        Ok(AuditView {
            run: run.metadata(),
            as_of_tick,
            keyframe_ticks: prefix.keyframe_ticks,
            summary,
            events,
        })
    }
}

impl std::fmt::Debug for ReplayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayService").finish_non_exhaustive()
    }
}
