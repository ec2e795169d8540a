//! Comparison of completed runs across sibling or related nodes.
//!
//! Read-only. The engine loads each node's terminal run, materializes its
//! final state through the replay service and ranks per-metric differences
//! against a baseline.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::{UniverseError, UniverseResult, ValidationError};
use crate::ids::{NodeId, RunId};
use crate::replay::ReplayService;
use crate::storage::{NodeStore, RunStore};

/// Below this magnitude a baseline value is treated as zero.
const BASELINE_EPSILON: f64 = 1e-9;

/// Input to [`ComparisonEngine::compare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    /// Between two and four nodes. Duplicates are allowed.
    pub node_ids: Vec<NodeId>,
    /// Pinned baseline; must be one of `node_ids`. Defaults to the first.
    pub baseline: Option<NodeId>,
    /// Metric used to pick the recommendation instead of probability.
    pub primary_metric: Option<String>,
}

impl CompareRequest {
    /// Compares `node_ids` against the first of them by probability.
    #[must_use]
    pub fn new(node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            node_ids: node_ids.into_iter().collect(),
            baseline: None,
            primary_metric: None,
        }
    }

    /// Pins the baseline.
    #[must_use]
    pub const fn with_baseline(mut self, node_id: NodeId) -> Self {
        self.baseline = Some(node_id);
        self
    }

    /// Recommends by this metric's final value.
    #[must_use]
    pub fn with_primary_metric(mut self, key: impl Into<String>) -> Self {
        self.primary_metric = Some(key.into());
        self
    }
}

/// One compared node's final outcome and its deltas against the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// Compared node.
    pub node_id: NodeId,
    /// The node's terminal run.
    pub run_id: RunId,
    /// Node label, if any.
    pub label: Option<String>,
    /// Branch probability of the node.
    pub probability: f64,
    /// Last recorded tick of the run.
    pub final_tick: u64,
    /// Metrics materialized at `final_tick`.
    pub final_metrics: BTreeMap<String, f64>,
    /// Event occurrences over the whole run.
    pub total_events: u64,
    /// Distinct agents seen over the whole run.
    pub total_agents: u64,
    /// `value - baseline` for every metric key of either side.
    pub metric_deltas: BTreeMap<String, f64>,
    /// `probability - baseline probability`.
    pub probability_delta: f64,
    /// `total_events - baseline total_events`.
    pub total_events_delta: i64,
    /// `total_agents - baseline total_agents`.
    pub total_agents_delta: i64,
}

/// A non-zero metric difference between a node and the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDifference {
    /// Node that differs from the baseline.
    pub node_id: NodeId,
    /// Metric that differs.
    pub metric_key: String,
    /// Baseline's final value; zero when the baseline lacks the metric.
    pub baseline_value: f64,
    /// The node's final value; zero when the node lacks the metric.
    pub value: f64,
    /// `(value - baseline) / |baseline|`, or the plain difference when the
    /// baseline is zero.
    pub normalized_difference: f64,
}

/// Why a node was recommended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationBasis {
    /// Highest value of the requested primary metric.
    PrimaryMetric,
    /// Highest branch probability.
    Probability,
    /// No differences were found; the baseline stands.
    NoDifferences,
}

/// The node a comparison suggests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Recommended node.
    pub node_id: NodeId,
    /// Rule that picked it.
    pub basis: RecommendationBasis,
}

/// Result of [`ComparisonEngine::compare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Node every delta is measured against.
    pub baseline: NodeId,
    /// One entry per input node, in input order.
    pub outcome_comparison: Vec<NodeOutcome>,
    /// Sorted by absolute normalized difference, largest first.
    pub key_differences: Vec<KeyDifference>,
    /// Suggested node.
    pub recommendation: Recommendation,
}

/// Compares terminal runs of up to four nodes.
pub struct ComparisonEngine {
    nodes: Arc<dyn NodeStore>,
    runs: Arc<dyn RunStore>,
    replay: Arc<ReplayService>,
}

impl ComparisonEngine {
    /// Creates an engine reading nodes, runs and telemetry from these services.
    #[must_use]
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        runs: Arc<dyn RunStore>,
        replay: Arc<ReplayService>,
    ) -> Self {
        Self {
            nodes,
            runs,
            replay,
        }
    }

    /// Builds a comparison report.
    ///
    /// # Errors
    ///
    /// - `Validation` for fewer than two or more than four nodes, or a pinned
    ///   baseline outside the set
    /// - `NotFound` if a node is not in the caller's project
    /// - `NotComparableYet` (retryable) if a node's run is missing, still
    ///   active, or recorded nothing
    pub fn compare(
        &self,
        ctx: &RequestContext,
        request: &CompareRequest,
    ) -> UniverseResult<ComparisonReport> {
        let count = request.node_ids.len();
        if !(2..=4).contains(&count) {
            return Err(ValidationError::ComparisonArity { actual: count }.into());
        }
        let baseline_pos = match request.baseline {
            Some(pinned) => request
                .node_ids
                .iter()
                .position(|id| *id == pinned)
                .ok_or(ValidationError::BaselineNotInSet { node_id: pinned })?,
            None => 0,
        };

        let mut outcomes = request
            .node_ids
            .iter()
            .map(|node_id| self.outcome(ctx, *node_id))
            .collect::<UniverseResult<Vec<_>>>()?;

        let baseline = outcomes[baseline_pos].clone();
        let mut key_differences = Vec::new();
        for (pos, outcome) in outcomes.iter_mut().enumerate() {
            let keys: BTreeSet<&String> = baseline
                .final_metrics
                .keys()
                .chain(outcome.final_metrics.keys())
                .collect();
            let mut deltas = BTreeMap::new();
            for key in keys {
                let b = baseline.final_metrics.get(key).copied().unwrap_or(0.0);
                let v = outcome.final_metrics.get(key).copied().unwrap_or(0.0);
                let delta = v - b;
                deltas.insert(key.clone(), delta);
                if pos != baseline_pos && delta != 0.0 {
                    let normalized_difference = if b.abs() < BASELINE_EPSILON {
                        delta
                    } else {
                        delta / b.abs()
                    };
                    key_differences.push((
                        pos,
                        KeyDifference {
                            node_id: outcome.node_id,
                            metric_key: key.clone(),
                            baseline_value: b,
                            value: v,
                            normalized_difference,
                        },
                    ));
                }
            }
            outcome.metric_deltas = deltas;
            outcome.probability_delta = outcome.probability - baseline.probability;
            outcome.total_events_delta = signed_delta(outcome.total_events, baseline.total_events);
            outcome.total_agents_delta = signed_delta(outcome.total_agents, baseline.total_agents);
        }

        key_differences.sort_by(|(pa, a), (pb, b)| {
            b.normalized_difference
                .abs()
                .total_cmp(&a.normalized_difference.abs())
                .then_with(|| a.metric_key.cmp(&b.metric_key))
                .then_with(|| pa.cmp(pb))
        });
        let key_differences: Vec<KeyDifference> =
            key_differences.into_iter().map(|(_, d)| d).collect();

        let recommendation = if key_differences.is_empty() {
            Recommendation {
                node_id: baseline.node_id,
                basis: RecommendationBasis::NoDifferences,
            }
        } else if let Some(metric) = &request.primary_metric {
            Recommendation {
                node_id: best_by(&outcomes, |o| {
                    o.final_metrics.get(metric).copied().unwrap_or(0.0)
                }),
                basis: RecommendationBasis::PrimaryMetric,
            }
        } else {
            Recommendation {
                node_id: best_by(&outcomes, |o| o.probability),
                basis: RecommendationBasis::Probability,
            }
        };

        tracing::debug!(
            project_id = %ctx.project_id,
            request_id = %ctx.request_id,
            nodes = count,
            differences = key_differences.len(),
            recommended = %recommendation.node_id,
            "comparison built"
        );
        Ok(ComparisonReport {
            baseline: baseline.node_id,
            outcome_comparison: outcomes,
            key_differences,
            recommendation,
        })
    }

    fn outcome(&self, ctx: &RequestContext, node_id: NodeId) -> UniverseResult<NodeOutcome> {
        let node = self
            .nodes
            .get(node_id)?
            .filter(|node| ctx.owns(node.project_id))
            .ok_or_else(|| UniverseError::node_not_found(node_id))?;
        let not_yet = |reason: String| UniverseError::NotComparableYet { node_id, reason };

        let run = self
            .runs
            .get(node.run_id)?
            .ok_or_else(|| not_yet("run has not been enqueued".to_string()))?;
        if !run.status.is_terminal() {
            return Err(not_yet(format!("run {} is {}", run.run_id, run.status)));
        }
        let summary = self.replay.get_summary(ctx, run.run_id)?;
        if summary.is_empty() {
            return Err(not_yet(format!("run {} recorded no telemetry", run.run_id)));
        }
        let state = self.replay.state_at(ctx, run.run_id, summary.total_ticks)?;

        Ok(NodeOutcome {
            node_id,
            run_id: run.run_id,
            label: node.label,
            probability: node.probability.value(),
            final_tick: summary.total_ticks,
            final_metrics: state.metrics,
            total_events: summary.total_events,
            total_agents: summary.total_agents,
            metric_deltas: BTreeMap::new(),
            probability_delta: 0.0,
            total_events_delta: 0,
            total_agents_delta: 0,
        })
    }
}

impl std::fmt::Debug for ComparisonEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComparisonEngine").finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn signed_delta(value: u64, baseline: u64) -> i64 {
    value as i64 - baseline as i64
}

/// First outcome with the strictly greatest score.
fn best_by(outcomes: &[NodeOutcome], score: impl Fn(&NodeOutcome) -> f64) -> NodeId {
    let mut best = &outcomes[0];
    let mut best_score = score(best);
    for outcome in &outcomes[1..] {
        let s = score(outcome);
        if s.total_cmp(&best_score) == Ordering::Greater {
            best = outcome;
            best_score = s;
        }
    }
    best.node_id
}
