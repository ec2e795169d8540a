//! Append path for telemetry logs.
//!
//! The recorder is the only writer of telemetry. Each append is checked
//! against the run's status and keyframe cadence, framed with the codec, and
//! written together with the index that covers it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{ResourceKind, UniverseError, UniverseResult, ValidationError};
use crate::ids::RunId;
use crate::run::{Run, RunStatus};
use crate::storage::codec;
use crate::storage::{RunStore, TelemetryLogStore};

use super::index::{TelemetryIndex, TelemetrySummary};
use super::is_keyframe_tick;
use super::types::{
    validate_signals, EventSignal, SimulationState, TelemetryDelta, TelemetryFrame, TickUpdate,
};

fn poisoned(context: &str) -> UniverseError {
    UniverseError::internal(format!("poisoned lock: {context}"))
}

/// Single writer of per-run telemetry logs.
pub struct TelemetryRecorder {
    runs: Arc<dyn RunStore>,
    logs: Arc<dyn TelemetryLogStore>,
    live: RwLock<HashMap<RunId, Arc<Mutex<TelemetryIndex>>>>,
}

impl TelemetryRecorder {
    /// Creates a recorder writing to `logs` and advancing runs in `runs`.
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>, logs: Arc<dyn TelemetryLogStore>) -> Self {
        Self {
            runs,
            logs,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Appends the full state at `tick`.
    ///
    /// `events_triggered` are the signals raised by the tick that produced
    /// `state`; pass an empty list for the initial keyframe.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the run has not started
    /// - `InvariantViolation` if the run is terminal
    /// - `Validation` if the tick is out of order, off cadence or beyond the run
    pub fn append_keyframe(
        &self,
        run_id: RunId,
        tick: u64,
        state: &SimulationState,
        events_triggered: Vec<EventSignal>,
    ) -> UniverseResult<()> {
        state.validate()?;
        validate_signals(&events_triggered)?;
        let mut keyframe = state.to_keyframe(run_id, tick);
        keyframe.events_triggered = events_triggered;
        self.append(run_id, &TelemetryFrame::Keyframe(keyframe))
    }

    /// Appends the sparse changes of `tick`.
    ///
    /// # Errors
    ///
    /// Same as [`TelemetryRecorder::append_keyframe`].
    pub fn append_delta(&self, run_id: RunId, tick: u64, update: TickUpdate) -> UniverseResult<()> {
        update.validate()?;
        let delta = TelemetryDelta::from_update(run_id, tick, update);
        self.append(run_id, &TelemetryFrame::Delta(delta))
    }

    fn append(&self, run_id: RunId, frame: &TelemetryFrame) -> UniverseResult<()> {
        let run = self.writable_run(run_id)?;
        let live = self.live_index(&run)?;
        let mut index = live.lock().map_err(|_| poisoned("recorder.index"))?;

        let tick = frame.tick();
        let expected = index.next_tick();
        if tick != expected {
            return Err(ValidationError::TickOutOfOrder {
                run_id,
                tick,
                expected,
            }
            .into());
        }
        if tick > run.total_ticks {
            return Err(ValidationError::TickOutOfRange {
                run_id,
                tick,
                last_tick: Some(run.total_ticks),
            }
            .into());
        }
        let wants_keyframe = is_keyframe_tick(tick, run.keyframe_interval);
        match frame {
            TelemetryFrame::Keyframe(_) if !wants_keyframe => {
                return Err(ValidationError::CadenceMismatch {
                    tick,
                    interval: run.keyframe_interval,
                    frame: "keyframe",
                }
                .into());
            }
            TelemetryFrame::Delta(_) if wants_keyframe => {
                return Err(ValidationError::CadenceMismatch {
                    tick,
                    interval: run.keyframe_interval,
                    frame: "delta",
                }
                .into());
            }
            _ => {}
        }

        let bytes = codec::encode(frame).map_err(|e| UniverseError::Storage {
            message: format!("failed to encode frame for run {run_id} tick {tick}: {e}"),
        })?;
        let offset = index.storage_ref.byte_size;
        let mut next = index.clone();
        next.observe(frame, offset, bytes.len() as u64);
        self.logs.append(run_id, &bytes, next.clone())?;
        *index = next;

        tracing::trace!(%run_id, tick, bytes = bytes.len(), "telemetry frame appended");
        Ok(())
    }

    fn writable_run(&self, run_id: RunId) -> UniverseResult<Run> {
        let run = self
            .runs
            .get(run_id)?
            .ok_or_else(|| UniverseError::run_not_found(run_id))?;
        if run.status.is_writable() {
            return Ok(run);
        }
        if run.status == RunStatus::Queued {
            return Err(UniverseError::Conflict {
                resource: ResourceKind::Run,
                id: run_id.to_string(),
                reason: "run has not started; telemetry is not writable yet".to_string(),
            });
        }
        tracing::error!(
            %run_id,
            status = %run.status,
            "telemetry append attempted on a terminal run"
        );
        Err(UniverseError::InvariantViolation {
            run_id,
            reason: format!("telemetry append after terminal status {}", run.status),
        })
    }

    fn live_index(&self, run: &Run) -> UniverseResult<Arc<Mutex<TelemetryIndex>>> {
        {
            let live = self.live.read().map_err(|_| poisoned("recorder.live"))?;
            if let Some(index) = live.get(&run.run_id) {
                return Ok(Arc::clone(index));
            }
        }

        let mut live = self.live.write().map_err(|_| poisoned("recorder.live"))?;
        if let Some(index) = live.get(&run.run_id) {
            return Ok(Arc::clone(index));
        }
        let index = match self.logs.index(run.run_id)? {
            Some(existing) => existing,
            None => {
                let location = self.logs.create(run.run_id)?;
                tracing::debug!(run_id = %run.run_id, %location, "telemetry log created");
                TelemetryIndex::new(run.run_id, location)
            }
        };
        let index = Arc::new(Mutex::new(index));
        live.insert(run.run_id, Arc::clone(&index));
        Ok(index)
    }

    /// Freezes the run's index once the run is terminal.
    ///
    /// Returns `None` when the run never recorded anything (cancelled while
    /// queued). Calling it again returns the same summary.
    ///
    /// # Errors
    ///
    /// `Conflict` if the run is not terminal yet.
    pub fn finalize(&self, run_id: RunId) -> UniverseResult<Option<TelemetrySummary>> {
        let run = self
            .runs
            .get(run_id)?
            .ok_or_else(|| UniverseError::run_not_found(run_id))?;
        if !run.status.is_terminal() {
            return Err(UniverseError::Conflict {
                resource: ResourceKind::Telemetry,
                id: run_id.to_string(),
                reason: format!("cannot finalize telemetry while run is {}", run.status),
            });
        }

        let live = self
            .live
            .write()
            .map_err(|_| poisoned("recorder.live"))?
            .remove(&run_id);
        let index = match live {
            Some(index) => index.lock().map_err(|_| poisoned("recorder.index"))?.clone(),
            None => match self.logs.index(run_id)? {
                Some(index) => index,
                None => return Ok(None),
            },
        };
        if index.finalized {
            return Ok(Some(index.summary()));
        }

        let mut frozen = index;
        frozen.freeze();
        let summary = frozen.summary();
        self.logs.publish_index(frozen)?;
        tracing::info!(
            %run_id,
            frames = summary.frame_count,
            last_tick = summary.total_ticks,
            events = summary.total_events,
            "telemetry index finalized"
        );
        Ok(Some(summary))
    }
}

impl std::fmt::Debug for TelemetryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryRecorder").finish_non_exhaustive()
    }
}
