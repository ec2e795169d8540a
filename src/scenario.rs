//! Compiled scenarios.
//!
//! A scenario arrives from the Ask compiler as loosely shaped JSON. It is
//! decoded exactly once, at the fork boundary, into a closed union of scenario
//! kinds and sealed with a content digest. Executors only ever see the typed
//! artifact; nothing downstream re-interprets free text per tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::confidence::ConfidenceLevel;
use crate::error::ValidationError;

/// Candidate produced by the Ask intent compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScenario {
    /// Variable name to numeric delta.
    pub variable_deltas: BTreeMap<String, f64>,
    /// Aggregate size of the change.
    pub total_magnitude: f64,
    /// Compiler confidence that the scenario is plausible, in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// The closed set of scenario kinds, each carrying exactly its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ScenarioKind {
    /// Shift one or more global simulation variables.
    Variable {
        /// Amount added to each named variable.
        variable_deltas: BTreeMap<String, f64>,
    },
    /// Inject an external event at a given tick.
    Event {
        /// Event name.
        event_id: String,
        /// Non-negative strength.
        intensity: f64,
        /// Tick the event fires at.
        at_tick: u64,
    },
    /// Override fields of a single agent's initial state.
    AgentOverride {
        /// Agent to override.
        agent_id: String,
        /// Fields replacing the agent's initial values.
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

impl ScenarioKind {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Variable { variable_deltas } => {
                if variable_deltas.is_empty() {
                    return Err(malformed("variable scenario has no variable_deltas"));
                }
                for (name, delta) in variable_deltas {
                    if name.trim().is_empty() {
                        return Err(malformed("variable name cannot be empty"));
                    }
                    if !delta.is_finite() {
                        return Err(ValidationError::NonFinite {
                            field: format!("variable_deltas.{name}"),
                        });
                    }
                }
            }
            Self::Event {
                event_id,
                intensity,
                ..
            } => {
                if event_id.trim().is_empty() {
                    return Err(malformed("event scenario has an empty event_id"));
                }
                if !intensity.is_finite() || *intensity < 0.0 {
                    return Err(malformed("event intensity must be a non-negative number"));
                }
            }
            Self::AgentOverride { agent_id, fields } => {
                if agent_id.trim().is_empty() {
                    return Err(malformed("agent override has an empty agent_id"));
                }
                if fields.is_empty() {
                    return Err(malformed("agent override has no fields"));
                }
            }
        }
        Ok(())
    }
}

fn malformed(reason: &str) -> ValidationError {
    ValidationError::MalformedScenario {
        reason: reason.to_string(),
    }
}

#[derive(Serialize)]
struct DigestInput<'a> {
    kind: &'a ScenarioKind,
    adjustment_factor: f64,
    confidence: ConfidenceLevel,
    magnitude: f64,
}

/// A scenario compiled once into its structured, immutable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledScenario {
    /// What the scenario changes.
    pub kind: ScenarioKind,
    /// Multiplier applied to the parent's probability when forking.
    pub adjustment_factor: f64,
    /// Confidence level given to nodes forked with it.
    pub confidence: ConfidenceLevel,
    /// Size of the change, used to rank scenarios.
    pub magnitude: f64,
    /// Hex blake3 digest of the canonical encoding of the fields above.
    pub digest: String,
}

impl CompiledScenario {
    /// Compiles and seals a scenario.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MalformedScenario` or `NonFinite` when a field
    /// is missing its required shape.
    pub fn compile(
        kind: ScenarioKind,
        adjustment_factor: f64,
        confidence: ConfidenceLevel,
        magnitude: f64,
    ) -> Result<Self, ValidationError> {
        kind.validate()?;
        if !adjustment_factor.is_finite() || adjustment_factor < 0.0 {
            return Err(malformed("adjustment_factor must be a non-negative number"));
        }
        if !magnitude.is_finite() || magnitude < 0.0 {
            return Err(malformed("magnitude must be a non-negative number"));
        }

        let digest = digest_of(&DigestInput {
            kind: &kind,
            adjustment_factor,
            confidence,
            magnitude,
        })?;

        Ok(Self {
            kind,
            adjustment_factor,
            confidence,
            magnitude,
            digest,
        })
    }

    /// Compiles an Ask-compiler candidate into a variable scenario.
    ///
    /// The candidate's confidence is used both as the probability adjustment
    /// and, bucketed, as the node's confidence level.
    ///
    /// # Errors
    ///
    /// Fails if the candidate has no deltas, non-finite numbers, or a
    /// confidence outside `[0.0, 1.0]`.
    pub fn from_candidate(candidate: &CandidateScenario) -> Result<Self, ValidationError> {
        if !candidate.confidence.is_finite() {
            return Err(ValidationError::NonFinite {
                field: "confidence".to_string(),
            });
        }
        let level = ConfidenceLevel::from_score(candidate.confidence)?;
        Self::compile(
            ScenarioKind::Variable {
                variable_deltas: candidate.variable_deltas.clone(),
            },
            candidate.confidence,
            level,
            candidate.total_magnitude,
        )
    }

    /// Decodes loosely typed scenario JSON into the closed union.
    ///
    /// # Errors
    ///
    /// Unknown kinds, missing or extra fields, and invalid values are all
    /// rejected as `ValidationError::MalformedScenario`.
    pub fn decode(value: &serde_json::Value) -> Result<Self, ValidationError> {
        let serde_json::Value::Object(fields) = value else {
            return Err(malformed("scenario must be a JSON object"));
        };
        let mut fields = fields.clone();

        let adjustment_factor = fields
            .remove("adjustment_factor")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| malformed("missing numeric adjustment_factor"))?;
        let confidence: ConfidenceLevel = fields
            .remove("confidence")
            .ok_or_else(|| malformed("missing confidence"))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| ValidationError::MalformedScenario {
                    reason: format!("confidence: {e}"),
                })
            })?;
        let magnitude = match fields.remove("magnitude") {
            None => 0.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| malformed("magnitude must be numeric"))?,
        };

        let kind: ScenarioKind = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| ValidationError::MalformedScenario {
                reason: e.to_string(),
            })?;
        Self::compile(kind, adjustment_factor, confidence, magnitude)
    }

    /// Recomputes the digest and compares it with the sealed one.
    #[must_use]
    pub fn verify(&self) -> bool {
        digest_of(&DigestInput {
            kind: &self.kind,
            adjustment_factor: self.adjustment_factor,
            confidence: self.confidence,
            magnitude: self.magnitude,
        })
        .map_or(false, |d| d == self.digest)
    }
}

fn digest_of(input: &DigestInput<'_>) -> Result<String, ValidationError> {
    let bytes = serde_json::to_vec(input).map_err(|e| ValidationError::MalformedScenario {
        reason: format!("cannot encode scenario: {e}"),
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_variable_scenario() {
        let raw = json!({
            "kind": "variable",
            "variable_deltas": {"interest_rate": 0.5},
            "adjustment_factor": 0.6,
            "confidence": "high"
        });
        let compiled = CompiledScenario::decode(&raw).unwrap();
        assert!(matches!(compiled.kind, ScenarioKind::Variable { .. }));
        assert_eq!(compiled.confidence, ConfidenceLevel::High);
        assert!(compiled.verify());
    }

    #[test]
    fn decode_rejects_unknown_kind_and_missing_fields() {
        let unknown = json!({"kind": "vibes", "adjustment_factor": 1.0, "confidence": "low"});
        assert!(matches!(
            CompiledScenario::decode(&unknown),
            Err(ValidationError::MalformedScenario { .. })
        ));

        let missing = json!({"kind": "event", "event_id": "flood", "adjustment_factor": 1.0, "confidence": "low"});
        assert!(CompiledScenario::decode(&missing).is_err());

        let stray = json!({
            "kind": "variable",
            "variable_deltas": {"x": 1.0},
            "adjustment_factor": 1.0,
            "confidence": "low",
            "prompt": "what if x went up"
        });
        assert!(CompiledScenario::decode(&stray).is_err());
    }

    #[test]
    fn compile_rejects_invalid_values() {
        let empty = ScenarioKind::Variable {
            variable_deltas: BTreeMap::new(),
        };
        assert!(CompiledScenario::compile(empty, 1.0, ConfidenceLevel::Low, 0.0).is_err());

        let event = ScenarioKind::Event {
            event_id: "storm".to_string(),
            intensity: 2.0,
            at_tick: 3,
        };
        assert!(CompiledScenario::compile(event.clone(), -0.5, ConfidenceLevel::Low, 0.0).is_err());
        assert!(CompiledScenario::compile(event, 0.5, ConfidenceLevel::Low, 1.0).is_ok());
    }

    #[test]
    fn digest_is_stable_and_content_addressed() {
        let mut deltas = BTreeMap::new();
        deltas.insert("a".to_string(), 1.0);
        deltas.insert("b".to_string(), -2.0);
        let kind = ScenarioKind::Variable {
            variable_deltas: deltas,
        };
        let x = CompiledScenario::compile(kind.clone(), 0.5, ConfidenceLevel::Medium, 3.0).unwrap();
        let y = CompiledScenario::compile(kind.clone(), 0.5, ConfidenceLevel::Medium, 3.0).unwrap();
        let z = CompiledScenario::compile(kind, 0.4, ConfidenceLevel::Medium, 3.0).unwrap();
        assert_eq!(x.digest, y.digest);
        assert_ne!(x.digest, z.digest);
    }

    #[test]
    fn from_candidate_buckets_confidence() {
        let mut deltas = BTreeMap::new();
        deltas.insert("unemployment".to_string(), 0.02);
        let candidate = CandidateScenario {
            variable_deltas: deltas,
            total_magnitude: 0.02,
            confidence: 0.3,
        };
        let compiled = CompiledScenario::from_candidate(&candidate).unwrap();
        assert_eq!(compiled.confidence, ConfidenceLevel::Low);
        assert!((compiled.adjustment_factor - 0.3).abs() < f64::EPSILON);

        let bad = CandidateScenario {
            confidence: 1.7,
            ..candidate
        };
        assert!(CompiledScenario::from_candidate(&bad).is_err());
    }
}
