//! Event occurrences derived from a telemetry log.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::{EventSignal, TelemetryFrame};

/// One start-to-end span of an event within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOccurrence {
    /// Event name.
    pub event_id: String,
    /// First tick the event was active.
    pub start_tick: u64,
    /// `None` while the event is still active at the end of the log.
    pub end_tick: Option<u64>,
    /// Distinct agents touched over the span.
    pub affected_agent_count: u64,
    /// Highest intensity signalled over the span.
    pub peak_intensity: f64,
}

impl EventOccurrence {
    /// Returns true if the occurrence overlaps the inclusive tick range.
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start_tick <= end && self.end_tick.map_or(true, |e| e >= start)
    }
}

#[derive(Debug)]
struct Open {
    start_tick: u64,
    agents: BTreeSet<String>,
    peak_intensity: f64,
}

impl Open {
    fn close(self, event_id: String, end_tick: Option<u64>) -> EventOccurrence {
        EventOccurrence {
            event_id,
            start_tick: self.start_tick,
            end_tick,
            affected_agent_count: self.agents.len() as u64,
            peak_intensity: self.peak_intensity,
        }
    }
}

/// Folds frames, in tick order, into event occurrences.
#[derive(Debug, Default)]
pub struct EventTracker {
    open: BTreeMap<String, Open>,
    closed: Vec<EventOccurrence>,
}

impl EventTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one frame; frames must arrive in tick order.
    pub fn observe(&mut self, frame: &TelemetryFrame) {
        match frame {
            TelemetryFrame::Keyframe(k) => {
                self.observe_signals(k.tick, &k.events_triggered);
                for event_id in &k.active_events {
                    self.open.entry(event_id.clone()).or_insert_with(|| Open {
                        start_tick: k.tick,
                        agents: BTreeSet::new(),
                        peak_intensity: 0.0,
                    });
                }
                let stale: Vec<String> = self
                    .open
                    .keys()
                    .filter(|id| !k.active_events.contains(*id))
                    .cloned()
                    .collect();
                for event_id in stale {
                    if let Some(open) = self.open.remove(&event_id) {
                        self.closed.push(open.close(event_id, Some(k.tick)));
                    }
                }
            }
            TelemetryFrame::Delta(d) => self.observe_signals(d.tick, &d.events_triggered),
        }
    }

    fn observe_signals(&mut self, tick: u64, signals: &[EventSignal]) {
        for signal in signals {
            let open = self
                .open
                .entry(signal.event_id.clone())
                .or_insert_with(|| Open {
                    start_tick: tick,
                    agents: BTreeSet::new(),
                    peak_intensity: signal.intensity,
                });
            open.agents.extend(signal.affected_agents.iter().cloned());
            if signal.intensity > open.peak_intensity {
                open.peak_intensity = signal.intensity;
            }
            if signal.ended {
                if let Some(open) = self.open.remove(&signal.event_id) {
                    self.closed.push(open.close(signal.event_id.clone(), Some(tick)));
                }
            }
        }
    }

    /// All occurrences seen, ordered by start tick then event id.
    #[must_use]
    pub fn finish(self) -> Vec<EventOccurrence> {
        let mut out = self.closed;
        out.extend(
            self.open
                .into_iter()
                .map(|(event_id, open)| open.close(event_id, None)),
        );
        out.sort_by(|a, b| {
            a.start_tick
                .cmp(&b.start_tick)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        out
    }
}
