//! Forking and universe map behaviour through the public facade.

mod common;

use std::sync::Arc;
use std::thread;

use universe_core::{
    EdgeVisibility, ErrorKind, ForkRequest, Node, NodeId, RequestContext, ShowAllEdges, Universe,
    UniverseConfig,
};

use common::{ctx, universe, variable_scenario};

#[test]
fn child_probability_follows_scenario_adjustment() {
    let u = universe();
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root().with_label("today")).unwrap();
    assert!(root.is_root());
    assert!(root.is_baseline);
    assert!((root.probability.value() - 1.0).abs() < f64::EPSILON);

    let child = u
        .fork(
            &ctx,
            ForkRequest::child_of(root.node_id)
                .with_label("rates up")
                .with_scenario(variable_scenario("interest_rate", 0.5, 0.6)),
        )
        .unwrap();
    assert!((child.probability.value() - 0.6).abs() < 1e-12);
    assert_eq!(child.parent_node_id, Some(root.node_id));
    assert!(child.has_outcome);
    assert!(!child.is_baseline);

    let grandchild = u
        .fork(
            &ctx,
            ForkRequest::child_of(child.node_id)
                .with_scenario(variable_scenario("interest_rate", 0.25, 0.5)),
        )
        .unwrap();
    assert!((grandchild.probability.value() - 0.3).abs() < 1e-12);

    let chain: Vec<NodeId> = u
        .forks()
        .ancestry(&ctx, grandchild.node_id)
        .unwrap()
        .into_iter()
        .map(|n| n.node_id)
        .collect();
    assert_eq!(chain, vec![grandchild.node_id, child.node_id, root.node_id]);
}

#[test]
fn forking_never_mutates_the_parent_beyond_child_count() {
    let u = universe();
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    u.fork(&ctx, ForkRequest::child_of(root.node_id)).unwrap();

    let reloaded = u.get_node(&ctx, root.node_id).unwrap();
    assert_eq!(reloaded.child_count, 1);
    assert!(reloaded.same_identity(&root));
}

#[test]
fn concurrent_forks_count_every_child() {
    let config = UniverseConfig {
        fork_max_retries: 10_000,
        ..UniverseConfig::default()
    };
    let u = Arc::new(Universe::in_memory(Arc::new(common::LcgEconomy), config).unwrap());
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let u = Arc::clone(&u);
            let ctx = ctx.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    u.fork(&ctx, ForkRequest::child_of(root.node_id)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(u.get_node(&ctx, root.node_id).unwrap().child_count, 40);
    let map = u.get_universe_map(&ctx, &ShowAllEdges).unwrap();
    assert_eq!(map.nodes.len(), 41);
    assert_eq!(map.visible_edges.len(), 40);
}

#[test]
fn explicit_probability_is_validated() {
    let u = universe();
    let ctx = ctx();
    let err = u
        .fork(&ctx, ForkRequest::root().with_probability(1.2))
        .unwrap_err();
    assert!(err.is_validation());

    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    let err = u
        .fork(
            &ctx,
            ForkRequest::child_of(root.node_id).with_scenario(variable_scenario("x", 1.0, 2.5)),
        )
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(u.get_node(&ctx, root.node_id).unwrap().child_count, 0);
}

#[test]
fn tampered_scenario_is_rejected() {
    let u = universe();
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    let mut scenario = variable_scenario("x", 1.0, 0.5);
    scenario.adjustment_factor = 0.9;
    let err = u
        .fork(&ctx, ForkRequest::child_of(root.node_id).with_scenario(scenario))
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn nodes_are_invisible_across_projects() {
    let u = universe();
    let mine = ctx();
    let theirs = ctx();
    let root = u.fork(&mine, ForkRequest::root()).unwrap();

    assert_eq!(
        u.get_node(&theirs, root.node_id).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        u.fork(&theirs, ForkRequest::child_of(root.node_id))
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert!(u
        .get_universe_map(&theirs, &ShowAllEdges)
        .unwrap()
        .nodes
        .is_empty());
}

struct HideUnlabeled;

impl EdgeVisibility for HideUnlabeled {
    fn is_visible(&self, _parent: &Node, child: &Node) -> bool {
        child.label.is_some()
    }
}

#[test]
fn visibility_policy_filters_edges_but_not_nodes() {
    let u = universe();
    let ctx: RequestContext = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    let shown = u
        .fork(&ctx, ForkRequest::child_of(root.node_id).with_label("shown"))
        .unwrap();
    u.fork(&ctx, ForkRequest::child_of(root.node_id)).unwrap();

    let map = u.get_universe_map(&ctx, &HideUnlabeled).unwrap();
    assert_eq!(map.nodes.len(), 3);
    assert_eq!(map.visible_edges.len(), 1);
    assert_eq!(map.visible_edges[0].child, shown.node_id);
}
