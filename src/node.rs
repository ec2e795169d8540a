//! Nodes of the universe map.
//!
//! A node is an immutable record of one branch point. The only field that
//! ever changes after insertion is `child_count`, guarded by `version`; both
//! are owned by the fork path in the node store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::{ConfidenceLevel, Probability};
use crate::ids::{NodeId, ProjectId, RunId};
use crate::scenario::CompiledScenario;

/// A simulation state snapshot reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id.
    pub node_id: NodeId,
    /// Owning project.
    pub project_id: ProjectId,
    /// `None` for a root.
    pub parent_node_id: Option<NodeId>,
    /// The run that produces this node's telemetry, allocated at fork time.
    pub run_id: RunId,
    /// Free-form label.
    pub label: Option<String>,
    /// Branch probability.
    pub probability: Probability,
    /// Confidence in the branch.
    pub confidence_level: ConfidenceLevel,
    /// Whether comparisons default to this node.
    pub is_baseline: bool,
    /// Whether the node carries a recorded outcome.
    pub has_outcome: bool,
    /// Scenario compiled at fork time, if the branch was scenario-driven.
    pub scenario: Option<CompiledScenario>,
    /// Number of children forked from this node.
    pub child_count: u64,
    /// Optimistic-concurrency guard for `child_count`.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Returns true if the node has no parent.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_node_id.is_none()
    }

    /// Compares every field that must never change after creation.
    ///
    /// `child_count` and `version` are deliberately excluded.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.project_id == other.project_id
            && self.parent_node_id == other.parent_node_id
            && self.run_id == other.run_id
            && self.label == other.label
            && self.probability == other.probability
            && self.confidence_level == other.confidence_level
            && self.is_baseline == other.is_baseline
            && self.has_outcome == other.has_outcome
            && self.scenario == other.scenario
            && self.created_at == other.created_at
    }
}

/// A parent to child link in the universe map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Parent end.
    pub parent: NodeId,
    /// Child end.
    pub child: NodeId,
}

/// Decides which parent to child links are shown in a universe map view.
///
/// The core returns raw ancestry; collapsing edges is a presentation policy
/// supplied by the caller.
pub trait EdgeVisibility: Send + Sync {
    /// Returns true if the edge from `parent` to `child` should be listed.
    fn is_visible(&self, parent: &Node, child: &Node) -> bool;
}

/// Default policy: every ancestry link is visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShowAllEdges;

impl EdgeVisibility for ShowAllEdges {
    fn is_visible(&self, _parent: &Node, _child: &Node) -> bool {
        true
    }
}

/// Full node set of a project plus the edges the policy kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseMap {
    /// Every node of the project.
    pub nodes: Vec<Node>,
    /// Edges the visibility policy kept.
    pub visible_edges: Vec<Edge>,
}
