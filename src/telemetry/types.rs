//! Telemetry frame types and state materialization.
//!
//! `SimulationState::apply` is the single materialization step. The scheduler
//! uses it to build keyframes while recording, and replay uses it to rebuild
//! state from a keyframe plus deltas, so both sides agree by construction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{AgentId, RunId};

/// Full state of one agent: a JSON object of fields.
pub type AgentState = serde_json::Map<String, serde_json::Value>;

/// Partial change to one agent's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    /// Agent to change.
    pub agent_id: AgentId,
    /// Fields to overwrite; absent fields keep their previous value.
    pub fields: AgentState,
}

/// An event observed at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSignal {
    /// Event name.
    pub event_id: String,
    /// Strength of the event at this tick; must be finite.
    pub intensity: f64,
    /// Agents the event touched at this tick.
    #[serde(default)]
    pub affected_agents: Vec<AgentId>,
    /// True on the tick the event stops.
    #[serde(default)]
    pub ended: bool,
}

/// Output of one executed tick, before it is framed for the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickUpdate {
    /// Agent fields changed at this tick.
    pub agent_updates: Vec<AgentUpdate>,
    /// Event signals raised at this tick.
    pub events_triggered: Vec<EventSignal>,
    /// Metrics whose value changed at this tick.
    pub metrics: BTreeMap<String, f64>,
}

impl TickUpdate {
    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        for (key, value) in &self.metrics {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite {
                    field: format!("metrics.{key}"),
                });
            }
        }
        validate_signals(&self.events_triggered)
    }
}

/// Rejects signals whose intensity cannot be encoded.
pub(crate) fn validate_signals(signals: &[EventSignal]) -> Result<(), ValidationError> {
    for signal in signals {
        if !signal.intensity.is_finite() {
            return Err(ValidationError::NonFinite {
                field: format!("events_triggered.{}.intensity", signal.event_id),
            });
        }
    }
    Ok(())
}

/// Full snapshot at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryKeyframe {
    /// Run the frame belongs to.
    pub run_id: RunId,
    /// Tick captured.
    pub tick: u64,
    /// Every agent's full state.
    pub agent_states: BTreeMap<AgentId, AgentState>,
    /// Every metric's value.
    pub metrics: BTreeMap<String, f64>,
    /// Events still ongoing at this tick.
    #[serde(default)]
    pub active_events: BTreeSet<String>,
    /// Event occurrences started up to this tick.
    pub event_count: u64,
    /// Signals raised by the tick this keyframe closes, if any.
    #[serde(default)]
    pub events_triggered: Vec<EventSignal>,
}

/// Sparse update between keyframes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDelta {
    /// Run the frame belongs to.
    pub run_id: RunId,
    /// Tick recorded.
    pub tick: u64,
    /// Agent fields changed at this tick.
    pub agent_updates: Vec<AgentUpdate>,
    /// Event signals raised at this tick.
    pub events_triggered: Vec<EventSignal>,
    /// Metrics changed at this tick.
    pub metrics: BTreeMap<String, f64>,
}

impl TelemetryDelta {
    /// Frames an executor update for `tick`.
    #[must_use]
    pub fn from_update(run_id: RunId, tick: u64, update: TickUpdate) -> Self {
        Self {
            run_id,
            tick,
            agent_updates: update.agent_updates,
            events_triggered: update.events_triggered,
            metrics: update.metrics,
        }
    }
}

/// The unit framed into a run's telemetry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum TelemetryFrame {
    /// Full snapshot.
    Keyframe(TelemetryKeyframe),
    /// Changes since the previous tick.
    Delta(TelemetryDelta),
}

impl TelemetryFrame {
    /// Tick of the frame.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        match self {
            Self::Keyframe(k) => k.tick,
            Self::Delta(d) => d.tick,
        }
    }

    /// Run of the frame.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        match self {
            Self::Keyframe(k) => k.run_id,
            Self::Delta(d) => d.run_id,
        }
    }
}

/// Materialized simulation state at some tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    /// Full state of every agent.
    pub agents: BTreeMap<AgentId, AgentState>,
    /// Current metric values.
    pub metrics: BTreeMap<String, f64>,
    /// Events started and not yet ended.
    pub active_events: BTreeSet<String>,
}

impl SimulationState {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the state captured by a keyframe.
    #[must_use]
    pub fn from_keyframe(keyframe: &TelemetryKeyframe) -> Self {
        Self {
            agents: keyframe.agent_states.clone(),
            metrics: keyframe.metrics.clone(),
            active_events: keyframe.active_events.clone(),
        }
    }

    /// Captures this state as a keyframe.
    #[must_use]
    pub fn to_keyframe(&self, run_id: RunId, tick: u64) -> TelemetryKeyframe {
        TelemetryKeyframe {
            run_id,
            tick,
            agent_states: self.agents.clone(),
            metrics: self.metrics.clone(),
            active_events: self.active_events.clone(),
            event_count: self.active_events.len() as u64,
            events_triggered: Vec::new(),
        }
    }

    /// Applies a tick's changes in order.
    pub fn apply(&mut self, update: &TickUpdate) {
        self.apply_parts(&update.agent_updates, &update.events_triggered, &update.metrics);
    }

    /// Applies a recorded delta in order.
    pub fn apply_delta(&mut self, delta: &TelemetryDelta) {
        self.apply_parts(&delta.agent_updates, &delta.events_triggered, &delta.metrics);
    }

    fn apply_parts(
        &mut self,
        agent_updates: &[AgentUpdate],
        events: &[EventSignal],
        metrics: &BTreeMap<String, f64>,
    ) {
        for update in agent_updates {
            let agent = self.agents.entry(update.agent_id.clone()).or_default();
            for (field, value) in &update.fields {
                agent.insert(field.clone(), value.clone());
            }
        }
        for signal in events {
            if signal.ended {
                self.active_events.remove(&signal.event_id);
            } else {
                self.active_events.insert(signal.event_id.clone());
            }
        }
        for (key, value) in metrics {
            self.metrics.insert(key.clone(), *value);
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        for (key, value) in &self.metrics {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite {
                    field: format!("metrics.{key}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> AgentState {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn apply_overwrites_fields_and_tracks_events() {
        let mut state = SimulationState::new();
        state.agents.insert("a1".to_string(), fields(json!({"mood": "calm", "cash": 10})));

        let mut metrics = BTreeMap::new();
        metrics.insert("gdp".to_string(), 1.5);
        let update = TickUpdate {
            agent_updates: vec![AgentUpdate {
                agent_id: "a1".to_string(),
                fields: fields(json!({"cash": 12})),
            }],
            events_triggered: vec![EventSignal {
                event_id: "strike".to_string(),
                intensity: 0.4,
                affected_agents: vec!["a1".to_string()],
                ended: false,
            }],
            metrics,
        };
        state.apply(&update);

        assert_eq!(state.agents["a1"]["mood"], json!("calm"));
        assert_eq!(state.agents["a1"]["cash"], json!(12));
        assert!(state.active_events.contains("strike"));
        assert_eq!(state.metrics["gdp"], 1.5);

        state.apply(&TickUpdate {
            events_triggered: vec![EventSignal {
                event_id: "strike".to_string(),
                intensity: 0.1,
                affected_agents: Vec::new(),
                ended: true,
            }],
            ..TickUpdate::default()
        });
        assert!(state.active_events.is_empty());
    }

    #[test]
    fn keyframe_round_trips_state() {
        let mut state = SimulationState::new();
        state.active_events.insert("flood".to_string());
        state.metrics.insert("x".to_string(), 2.0);
        let kf = state.to_keyframe(RunId::new(), 10);
        assert_eq!(kf.event_count, 1);
        assert_eq!(SimulationState::from_keyframe(&kf), state);
    }

    #[test]
    fn update_validation_rejects_non_finite_metrics() {
        let mut update = TickUpdate::default();
        update.metrics.insert("bad".to_string(), f64::NAN);
        assert!(update.validate().is_err());
    }
}
