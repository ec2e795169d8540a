//! Fork service: the only producer of nodes.
//!
//! Forking inserts a child and increments the parent's `child_count` in one
//! version-checked store call. Nothing else about an existing node ever
//! changes. A lost race on the parent's version is retried after reloading
//! the parent.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::confidence::{ConfidenceLevel, Probability};
use crate::context::RequestContext;
use crate::error::{ResourceKind, UniverseError, UniverseResult, ValidationError};
use crate::ids::{NodeId, RunId};
use crate::node::{Edge, EdgeVisibility, Node, UniverseMap};
use crate::scenario::CompiledScenario;
use crate::storage::{NodeStore, StorageError};

/// Input to [`ForkService::fork`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForkRequest {
    /// `None` creates a root.
    pub parent_node_id: Option<NodeId>,
    /// Free-form label shown on the map.
    pub label: Option<String>,
    /// Compiled once at the ask boundary; never raw text.
    pub scenario: Option<CompiledScenario>,
    /// Explicit probability; otherwise derived from the parent and scenario.
    pub probability: Option<f64>,
    /// Marks the node as a comparison baseline.
    pub is_baseline: Option<bool>,
    /// Marks the node as carrying a recorded outcome.
    pub has_outcome: Option<bool>,
}

impl ForkRequest {
    /// A root node request.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// A child of `parent`.
    #[must_use]
    pub fn child_of(parent: NodeId) -> Self {
        Self {
            parent_node_id: Some(parent),
            ..Self::default()
        }
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attaches a compiled scenario.
    #[must_use]
    pub fn with_scenario(mut self, scenario: CompiledScenario) -> Self {
        self.scenario = Some(scenario);
        self
    }

    /// Sets an explicit probability.
    #[must_use]
    pub const fn with_probability(mut self, probability: f64) -> Self {
        self.probability = Some(probability);
        self
    }

    /// Sets the baseline flag.
    #[must_use]
    pub const fn baseline(mut self, is_baseline: bool) -> Self {
        self.is_baseline = Some(is_baseline);
        self
    }
}

/// Creates nodes and serves read-only views of the universe map.
pub struct ForkService {
    nodes: Arc<dyn NodeStore>,
    max_retries: u32,
}

impl ForkService {
    /// Creates a service over `nodes`; `max_retries` is clamped to at least one.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeStore>, max_retries: u32) -> Self {
        Self {
            nodes,
            max_retries: max_retries.max(1),
        }
    }

    /// Creates a root or child node.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the parent does not exist in the caller's project
    /// - `Validation` if the derived probability leaves `[0, 1]` or the
    ///   scenario digest does not match its content
    /// - `Conflict` if the parent kept changing for every retry
    pub fn fork(&self, ctx: &RequestContext, request: ForkRequest) -> UniverseResult<Node> {
        if let Some(scenario) = &request.scenario {
            if !scenario.verify() {
                return Err(ValidationError::MalformedScenario {
                    reason: "scenario digest does not match its content".to_string(),
                }
                .into());
            }
        }
        match request.parent_node_id {
            None => self.fork_root(ctx, request),
            Some(parent_id) => self.fork_child(ctx, parent_id, request),
        }
    }

    fn fork_root(&self, ctx: &RequestContext, request: ForkRequest) -> UniverseResult<Node> {
        let probability = match request.probability {
            Some(p) => Probability::new(p)?,
            None => Probability::ONE,
        };
        let confidence_level = request
            .scenario
            .as_ref()
            .map_or_else(ConfidenceLevel::default, |s| s.confidence);
        let node = Node {
            node_id: NodeId::new(),
            project_id: ctx.project_id,
            parent_node_id: None,
            run_id: RunId::new(),
            label: request.label,
            probability,
            confidence_level,
            is_baseline: request.is_baseline.unwrap_or(true),
            has_outcome: request
                .has_outcome
                .unwrap_or(request.scenario.is_some()),
            scenario: request.scenario,
            child_count: 0,
            version: 0,
            created_at: Utc::now(),
        };
        self.nodes.insert_root(node.clone())?;
        tracing::info!(
            project_id = %ctx.project_id,
            request_id = %ctx.request_id,
            node_id = %node.node_id,
            "root node created"
        );
        Ok(node)
    }

    fn fork_child(
        &self,
        ctx: &RequestContext,
        parent_id: NodeId,
        request: ForkRequest,
    ) -> UniverseResult<Node> {
        for attempt in 1..=self.max_retries {
            let parent = self.get_node(ctx, parent_id)?;

            let probability = match (request.probability, &request.scenario) {
                (Some(p), _) => Probability::new(p)?,
                (None, Some(scenario)) => parent.probability.adjusted(scenario.adjustment_factor)?,
                (None, None) => parent.probability,
            };
            let confidence_level = request
                .scenario
                .as_ref()
                .map_or(parent.confidence_level, |s| s.confidence);

            let child = Node {
                node_id: NodeId::new(),
                project_id: parent.project_id,
                parent_node_id: Some(parent.node_id),
                run_id: RunId::new(),
                label: request.label.clone(),
                probability,
                confidence_level,
                is_baseline: request.is_baseline.unwrap_or(false),
                has_outcome: request
                    .has_outcome
                    .unwrap_or(request.scenario.is_some()),
                scenario: request.scenario.clone(),
                child_count: 0,
                version: 0,
                created_at: Utc::now(),
            };

            match self.nodes.insert_child(child.clone(), parent.version) {
                Ok(updated_parent) => {
                    tracing::info!(
                        project_id = %ctx.project_id,
                        request_id = %ctx.request_id,
                        parent_id = %parent_id,
                        node_id = %child.node_id,
                        probability = child.probability.value(),
                        child_count = updated_parent.child_count,
                        "node forked"
                    );
                    return Ok(child);
                }
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(
                        %parent_id,
                        attempt,
                        expected,
                        actual,
                        "parent changed during fork; retrying"
                    );
                }
                Err(other) => return Err(other.into()),
            }
        }

        tracing::warn!(%parent_id, retries = self.max_retries, "fork retries exhausted");
        Err(UniverseError::Conflict {
            resource: ResourceKind::Node,
            id: parent_id.to_string(),
            reason: format!(
                "parent kept changing; gave up after {} attempts",
                self.max_retries
            ),
        })
    }

    /// Loads a node of the caller's project.
    ///
    /// # Errors
    ///
    /// `NotFound` if the node is missing or belongs to another project.
    pub fn get_node(&self, ctx: &RequestContext, node_id: NodeId) -> UniverseResult<Node> {
        self.nodes
            .get(node_id)?
            .filter(|node| ctx.owns(node.project_id))
            .ok_or_else(|| UniverseError::node_not_found(node_id))
    }

    /// All nodes of the caller's project with the edges `policy` keeps.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub fn get_universe_map(
        &self,
        ctx: &RequestContext,
        policy: &dyn EdgeVisibility,
    ) -> UniverseResult<UniverseMap> {
        let nodes = self.nodes.list_by_project(ctx.project_id)?;
        let by_id: std::collections::HashMap<NodeId, &Node> =
            nodes.iter().map(|n| (n.node_id, n)).collect();
        let visible_edges = nodes
            .iter()
            .filter_map(|child| {
                let parent = by_id.get(&child.parent_node_id?)?;
                policy.is_visible(parent, child).then_some(Edge {
                    parent: parent.node_id,
                    child: child.node_id,
                })
            })
            .collect();
        Ok(UniverseMap {
            nodes,
            visible_edges,
        })
    }

    /// The chain from `node_id` up to its root, starting with the node itself.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown node; `DataIntegrity` if a parent link is
    /// dangling or loops.
    pub fn ancestry(&self, ctx: &RequestContext, node_id: NodeId) -> UniverseResult<Vec<Node>> {
        let mut chain = vec![self.get_node(ctx, node_id)?];
        let mut seen = std::collections::HashSet::from([node_id]);
        while let Some(parent_id) = chain.last().and_then(|n| n.parent_node_id) {
            if !seen.insert(parent_id) {
                return Err(UniverseError::DataIntegrity {
                    location: format!("node:{node_id}"),
                    message: format!("ancestry loops back to {parent_id}"),
                });
            }
            let parent = self
                .nodes
                .get(parent_id)?
                .ok_or_else(|| UniverseError::DataIntegrity {
                    location: format!("node:{node_id}"),
                    message: format!("dangling parent link to {parent_id}"),
                })?;
            chain.push(parent);
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for ForkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkService")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
