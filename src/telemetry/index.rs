//! Per-run telemetry index.
//!
//! The index is a read-optimized projection of the log: keyframe positions for
//! O(log n) seeks plus the sets of metric keys, agents and events seen so far.
//! It is updated as frames are appended, frozen when the run terminates, and
//! can always be rebuilt from the log bytes alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::RunId;
use crate::storage::codec::{self, FrameIter};

use super::types::{EventSignal, TelemetryFrame};

/// Where a run's log lives and how many bytes of it the index covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    /// Backend-specific log location.
    pub location: String,
    /// Logical length of the log covered by the index.
    pub byte_size: u64,
}

/// Counts derived from an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    /// Run the log belongs to.
    pub run_id: RunId,
    /// Highest tick recorded (0 when only the initial keyframe exists).
    pub total_ticks: u64,
    /// Event occurrences started.
    pub total_events: u64,
    /// Distinct agents observed.
    pub total_agents: u64,
    /// Frames recorded, keyframes included.
    pub frame_count: u64,
    /// True once the run is terminal and the index frozen.
    pub finalized: bool,
}

impl TelemetrySummary {
    /// True when no frame was ever recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frame_count == 0
    }
}

/// Sidecar index for one run's telemetry log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryIndex {
    /// Run the log belongs to.
    pub run_id: RunId,
    /// Ascending.
    pub keyframe_ticks: Vec<u64>,
    /// Byte offset of each keyframe, parallel to `keyframe_ticks`.
    pub keyframe_offsets: Vec<u64>,
    /// Every metric key seen.
    pub metric_keys: BTreeSet<String>,
    /// Every agent seen.
    pub agent_ids: BTreeSet<String>,
    /// Every event id signalled.
    pub event_ids: BTreeSet<String>,
    /// Events started and not yet ended as of `last_tick`.
    pub open_events: BTreeSet<String>,
    /// Event occurrences started.
    pub total_events: u64,
    /// Highest tick recorded; `None` for an empty log.
    pub last_tick: Option<u64>,
    /// Frames recorded, keyframes included.
    pub frame_count: u64,
    /// Where the log lives.
    pub storage_ref: StorageRef,
    /// Frozen indexes accept no further frames.
    pub finalized: bool,
}

impl TelemetryIndex {
    /// An empty index for the log at `location`.
    #[must_use]
    pub fn new(run_id: RunId, location: impl Into<String>) -> Self {
        Self {
            run_id,
            keyframe_ticks: Vec::new(),
            keyframe_offsets: Vec::new(),
            metric_keys: BTreeSet::new(),
            agent_ids: BTreeSet::new(),
            event_ids: BTreeSet::new(),
            open_events: BTreeSet::new(),
            total_events: 0,
            last_tick: None,
            frame_count: 0,
            storage_ref: StorageRef {
                location: location.into(),
                byte_size: 0,
            },
            finalized: false,
        }
    }

    /// The only tick the next append may carry.
    #[must_use]
    pub fn next_tick(&self) -> u64 {
        self.last_tick.map_or(0, |t| t + 1)
    }

    /// Folds one appended frame into the index.
    ///
    /// `offset` is where the frame starts in the log and `len` its framed size.
    pub fn observe(&mut self, frame: &TelemetryFrame, offset: u64, len: u64) {
        match frame {
            TelemetryFrame::Keyframe(k) => {
                self.keyframe_ticks.push(k.tick);
                self.keyframe_offsets.push(offset);
                self.metric_keys.extend(k.metrics.keys().cloned());
                self.agent_ids.extend(k.agent_states.keys().cloned());
                self.observe_signals(&k.events_triggered);
                // Events present in the snapshot but never signalled (initial state).
                for event in &k.active_events {
                    self.event_ids.insert(event.clone());
                    if self.open_events.insert(event.clone()) {
                        self.total_events += 1;
                    }
                }
                self.open_events.retain(|e| k.active_events.contains(e));
            }
            TelemetryFrame::Delta(d) => {
                self.metric_keys.extend(d.metrics.keys().cloned());
                for update in &d.agent_updates {
                    self.agent_ids.insert(update.agent_id.clone());
                }
                self.observe_signals(&d.events_triggered);
            }
        }
        self.last_tick = Some(frame.tick());
        self.frame_count += 1;
        self.storage_ref.byte_size = offset + len;
    }

    fn observe_signals(&mut self, signals: &[EventSignal]) {
        for signal in signals {
            self.event_ids.insert(signal.event_id.clone());
            self.agent_ids.extend(signal.affected_agents.iter().cloned());
            if !self.open_events.contains(&signal.event_id) {
                self.total_events += 1;
            }
            if signal.ended {
                self.open_events.remove(&signal.event_id);
            } else {
                self.open_events.insert(signal.event_id.clone());
            }
        }
    }

    /// Greatest keyframe at or before `tick`, as `(keyframe_tick, offset)`.
    #[must_use]
    pub fn keyframe_at_or_before(&self, tick: u64) -> Option<(u64, u64)> {
        let pos = self.keyframe_ticks.partition_point(|&k| k <= tick);
        if pos == 0 {
            return None;
        }
        Some((self.keyframe_ticks[pos - 1], self.keyframe_offsets[pos - 1]))
    }

    /// Byte range holding the keyframe covering `tick` and the deltas after it.
    #[must_use]
    pub fn segment_for(&self, tick: u64) -> Option<(u64, u64)> {
        let pos = self.keyframe_ticks.partition_point(|&k| k <= tick);
        if pos == 0 {
            return None;
        }
        let start = self.keyframe_offsets[pos - 1];
        let end = self
            .keyframe_offsets
            .get(pos)
            .copied()
            .unwrap_or(self.storage_ref.byte_size);
        Some((start, end))
    }

    /// Counts for summary reads.
    #[must_use]
    pub fn summary(&self) -> TelemetrySummary {
        TelemetrySummary {
            run_id: self.run_id,
            total_ticks: self.last_tick.unwrap_or(0),
            total_events: self.total_events,
            total_agents: self.agent_ids.len() as u64,
            frame_count: self.frame_count,
            finalized: self.finalized,
        }
    }

    /// Marks the index immutable.
    pub fn freeze(&mut self) {
        self.finalized = true;
    }

    /// Rebuilds the index from raw log bytes.
    ///
    /// Decoding stops at the first torn or corrupt frame; the returned length is
    /// the prefix of `bytes` made of whole, valid frames.
    #[must_use]
    pub fn rebuild(run_id: RunId, location: impl Into<String>, bytes: &[u8]) -> (Self, u64) {
        let mut index = Self::new(run_id, location);
        let mut valid_len = 0;
        for item in FrameIter::<TelemetryFrame>::new(bytes) {
            let Ok((offset, frame)) = item else {
                tracing::warn!(
                    %run_id,
                    valid_len,
                    total_len = bytes.len(),
                    "telemetry log has a torn or corrupt tail; indexing the valid prefix"
                );
                break;
            };
            if frame.run_id() != run_id || frame.tick() != index.next_tick() {
                tracing::warn!(%run_id, tick = frame.tick(), "unexpected frame while rebuilding index");
                break;
            }
            let Some(end) = codec::frame_len(bytes, offset).map(|len| offset + len) else {
                break;
            };
            index.observe(&frame, offset, end - offset);
            valid_len = end;
        }
        (index, valid_len)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::storage::codec;
    use crate::telemetry::types::{SimulationState, TelemetryDelta};

    fn log_for(run_id: RunId, ticks: u64, interval: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut state = SimulationState::new();
        for tick in 0..=ticks {
            let frame = if tick % interval == 0 {
                TelemetryFrame::Keyframe(state.to_keyframe(run_id, tick))
            } else {
                let mut metrics = BTreeMap::new();
                #[allow(clippy::cast_precision_loss)]
                metrics.insert("m".to_string(), tick as f64);
                let delta = TelemetryDelta {
                    run_id,
                    tick,
                    agent_updates: Vec::new(),
                    events_triggered: Vec::new(),
                    metrics,
                };
                state.apply_delta(&delta);
                TelemetryFrame::Delta(delta)
            };
            bytes.extend_from_slice(&codec::encode(&frame).unwrap());
        }
        bytes
    }

    #[test]
    fn keyframe_lookup_uses_greatest_at_or_before() {
        let run_id = RunId::new();
        let bytes = log_for(run_id, 100, 10);
        let (index, valid) = TelemetryIndex::rebuild(run_id, "mem://x", &bytes);
        assert_eq!(valid, bytes.len() as u64);
        assert_eq!(index.keyframe_ticks.len(), 11);
        assert_eq!(index.keyframe_at_or_before(47).map(|(t, _)| t), Some(40));
        assert_eq!(index.keyframe_at_or_before(40).map(|(t, _)| t), Some(40));
        assert_eq!(index.keyframe_at_or_before(0).map(|(t, _)| t), Some(0));
        assert_eq!(index.last_tick, Some(100));
        assert!(index.metric_keys.contains("m"));
    }

    #[test]
    fn segment_ends_at_next_keyframe_or_log_end() {
        let run_id = RunId::new();
        let bytes = log_for(run_id, 25, 10);
        let (index, _) = TelemetryIndex::rebuild(run_id, "mem://x", &bytes);
        let (start, end) = index.segment_for(13).unwrap();
        assert_eq!(start, index.keyframe_offsets[1]);
        assert_eq!(end, index.keyframe_offsets[2]);
        let (_, tail_end) = index.segment_for(25).unwrap();
        assert_eq!(tail_end, bytes.len() as u64);
    }

    #[test]
    fn rebuild_stops_at_torn_tail() {
        let run_id = RunId::new();
        let mut bytes = log_for(run_id, 12, 10);
        let full = bytes.len();
        bytes.truncate(full - 3);
        let (index, valid) = TelemetryIndex::rebuild(run_id, "mem://x", &bytes);
        assert_eq!(index.last_tick, Some(11));
        assert!(valid < bytes.len() as u64);
        assert_eq!(index.storage_ref.byte_size, valid);
    }

    #[test]
    fn event_occurrences_are_counted_once_per_start() {
        let run_id = RunId::new();
        let mut index = TelemetryIndex::new(run_id, "mem://x");
        let kf = SimulationState::new().to_keyframe(run_id, 0);
        index.observe(&TelemetryFrame::Keyframe(kf), 0, 10);

        let signal = |ended| EventSignal {
            event_id: "riot".to_string(),
            intensity: 1.0,
            affected_agents: vec!["a".to_string()],
            ended,
        };
        for (tick, ended) in [(1, false), (2, false), (3, true), (4, false)] {
            let delta = TelemetryDelta {
                run_id,
                tick,
                agent_updates: Vec::new(),
                events_triggered: vec![signal(ended)],
                metrics: BTreeMap::new(),
            };
            index.observe(&TelemetryFrame::Delta(delta), tick * 10, 10);
        }
        let summary = index.summary();
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.total_agents, 1);
        assert_eq!(summary.total_ticks, 4);
        assert!(!summary.finalized);
    }
}
