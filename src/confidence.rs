//! Probability and confidence types attached to nodes.
//!
//! A node's probability is inherited down the fork chain, so it is kept as a
//! validated newtype: a value outside `[0.0, 1.0]` can never be stored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Likelihood of a branch, always within `[0.0, 1.0]`.
///
/// # Examples
///
/// ```
/// use universe_core::Probability;
///
/// let p = Probability::new(0.6).unwrap();
/// assert!((p.value() - 0.6).abs() < f64::EPSILON);
/// assert!(Probability::new(1.2).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Probability(f64);

impl Probability {
    /// Certainty; the default probability of a root node.
    pub const ONE: Self = Self(1.0);

    /// Creates a probability with validation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ProbabilityOutOfRange` if the value is not a
    /// finite number in `[0.0, 1.0]`.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::ProbabilityOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// The probability as a plain number.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// Scales this probability by a scenario adjustment factor.
    ///
    /// # Errors
    ///
    /// Fails if the factor is not finite or the product leaves `[0.0, 1.0]`.
    pub fn adjusted(self, factor: f64) -> Result<Self, ValidationError> {
        if !factor.is_finite() {
            return Err(ValidationError::NonFinite {
                field: "adjustment_factor".to_string(),
            });
        }
        Self::new(self.0 * factor)
    }
}

impl Default for Probability {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<f64> for Probability {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Probability> for f64 {
    fn from(p: Probability) -> Self {
        p.0
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Coarse confidence bucket shown alongside a node's probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    /// Weak support.
    Low,
    /// Moderate support.
    Medium,
    /// Strong support.
    High,
}

impl ConfidenceLevel {
    /// Buckets a raw confidence score in `[0.0, 1.0]`.
    ///
    /// Below 0.4 is low, below 0.75 is medium, anything else is high.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ProbabilityOutOfRange` for scores outside the unit interval.
    pub fn from_score(score: f64) -> Result<Self, ValidationError> {
        let p = Probability::new(score)?;
        Ok(if p.value() < 0.4 {
            Self::Low
        } else if p.value() < 0.75 {
            Self::Medium
        } else {
            Self::High
        })
    }
}

impl Default for ConfidenceLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_rejects_out_of_range() {
        assert!(Probability::new(-0.01).is_err());
        assert!(Probability::new(1.01).is_err());
        assert!(Probability::new(f64::NAN).is_err());
        assert!(Probability::new(0.0).is_ok());
        assert!(Probability::new(1.0).is_ok());
    }

    #[test]
    fn probability_adjustment_multiplies() {
        let p = Probability::ONE.adjusted(0.6).unwrap();
        assert!((p.value() - 0.6).abs() < 1e-12);
        let q = p.adjusted(0.5).unwrap();
        assert!((q.value() - 0.3).abs() < 1e-12);
        assert!(p.adjusted(2.0).is_err());
        assert!(p.adjusted(f64::INFINITY).is_err());
    }

    #[test]
    fn probability_deserialization_is_validated() {
        let ok: Probability = serde_json::from_str("0.25").unwrap();
        assert!((ok.value() - 0.25).abs() < f64::EPSILON);
        assert!(serde_json::from_str::<Probability>("3.0").is_err());
    }

    #[test]
    fn confidence_level_buckets() {
        assert_eq!(ConfidenceLevel::from_score(0.1).unwrap(), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.5).unwrap(), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.9).unwrap(), ConfidenceLevel::High);
        assert!(ConfidenceLevel::from_score(1.5).is_err());
    }

    #[test]
    fn confidence_level_serializes_snake_case() {
        let json = serde_json::to_string(&ConfidenceLevel::High).unwrap();
        assert_eq!(json, "\"high\"");
    }
}
