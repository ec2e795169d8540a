//! Comparison reports over finished runs.

mod common;

use universe_core::{CompareRequest, ErrorKind, ForkRequest, NodeId, RecommendationBasis};

use common::{ctx, executed, universe, variable_scenario};

#[test]
fn node_against_itself_has_no_differences() {
    let u = universe();
    let ctx = ctx();
    let (node, _) = executed(&u, &ctx, ForkRequest::root(), 17, 40);

    let report = u
        .compare(&ctx, &CompareRequest::new([node.node_id, node.node_id]))
        .unwrap();
    assert_eq!(report.baseline, node.node_id);
    assert!(report.key_differences.is_empty());
    assert_eq!(report.recommendation.node_id, node.node_id);
    assert_eq!(report.recommendation.basis, RecommendationBasis::NoDifferences);
    for outcome in &report.outcome_comparison {
        assert!(outcome.metric_deltas.values().all(|d| *d == 0.0));
        assert!(outcome.probability_delta.abs() < f64::EPSILON);
        assert_eq!(outcome.total_events_delta, 0);
        assert_eq!(outcome.total_agents_delta, 0);
        assert_eq!(outcome.final_tick, 40);
    }
}

#[test]
fn ranks_differences_and_recommends() {
    let u = universe();
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    let (base, _) = executed(&u, &ctx, ForkRequest::child_of(root.node_id), 21, 50);
    let (boom, _) = executed(
        &u,
        &ctx,
        ForkRequest::child_of(root.node_id)
            .with_label("stimulus")
            .with_scenario(variable_scenario("spending", 5.0, 0.5)),
        21,
        50,
    );
    let (bust, _) = executed(
        &u,
        &ctx,
        ForkRequest::child_of(root.node_id)
            .with_label("austerity")
            .with_scenario(variable_scenario("spending", -5.0, 0.9)),
        21,
        50,
    );
    let nodes = [base.node_id, boom.node_id, bust.node_id];

    let by_gdp = u
        .compare(&ctx, &CompareRequest::new(nodes).with_primary_metric("gdp"))
        .unwrap();
    assert_eq!(by_gdp.baseline, base.node_id);
    assert_eq!(by_gdp.recommendation.node_id, boom.node_id);
    assert_eq!(by_gdp.recommendation.basis, RecommendationBasis::PrimaryMetric);

    let order: Vec<NodeId> = by_gdp.outcome_comparison.iter().map(|o| o.node_id).collect();
    assert_eq!(order, nodes.to_vec());
    assert!(by_gdp.outcome_comparison[1].metric_deltas["gdp"] > 0.0);
    assert!(by_gdp.outcome_comparison[2].metric_deltas["gdp"] < 0.0);
    assert!((by_gdp.outcome_comparison[1].probability_delta - -0.5).abs() < 1e-12);

    assert!(!by_gdp.key_differences.is_empty());
    assert!(by_gdp
        .key_differences
        .iter()
        .all(|d| d.node_id != base.node_id && d.normalized_difference != 0.0));
    for pair in by_gdp.key_differences.windows(2) {
        assert!(pair[0].normalized_difference.abs() >= pair[1].normalized_difference.abs());
    }

    let by_probability = u.compare(&ctx, &CompareRequest::new(nodes)).unwrap();
    assert_eq!(by_probability.recommendation.node_id, base.node_id);
    assert_eq!(
        by_probability.recommendation.basis,
        RecommendationBasis::Probability
    );
}

#[test]
fn pinned_baseline_shifts_deltas() {
    let u = universe();
    let ctx = ctx();
    let root = u.fork(&ctx, ForkRequest::root()).unwrap();
    let (a, _) = executed(&u, &ctx, ForkRequest::child_of(root.node_id), 4, 20);
    let (b, _) = executed(
        &u,
        &ctx,
        ForkRequest::child_of(root.node_id).with_scenario(variable_scenario("x", 3.0, 0.5)),
        4,
        20,
    );

    let report = u
        .compare(
            &ctx,
            &CompareRequest::new([a.node_id, b.node_id]).with_baseline(b.node_id),
        )
        .unwrap();
    assert_eq!(report.baseline, b.node_id);
    assert!(report.key_differences.iter().all(|d| d.node_id == a.node_id));
    assert!(report.outcome_comparison[0].metric_deltas["gdp"] < 0.0);
    assert!(report.outcome_comparison[1]
        .metric_deltas
        .values()
        .all(|d| *d == 0.0));
}

#[test]
fn arity_and_baseline_are_validated() {
    let u = universe();
    let ctx = ctx();
    let (a, _) = executed(&u, &ctx, ForkRequest::root(), 1, 5);

    let err = u.compare(&ctx, &CompareRequest::new([a.node_id])).unwrap_err();
    assert!(err.is_validation());
    let err = u
        .compare(&ctx, &CompareRequest::new([a.node_id; 5]))
        .unwrap_err();
    assert!(err.is_validation());
    let err = u
        .compare(
            &ctx,
            &CompareRequest::new([a.node_id, a.node_id]).with_baseline(NodeId::new()),
        )
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn unfinished_runs_are_not_comparable_yet() {
    let u = universe();
    let ctx = ctx();
    let (done, _) = executed(&u, &ctx, ForkRequest::root(), 1, 5);
    let (queued, _) = u
        .execute_scenario(&ctx, ForkRequest::root(), 2, 5)
        .unwrap();
    let never_enqueued = u.fork(&ctx, ForkRequest::root()).unwrap();

    for pending in [queued.node_id, never_enqueued.node_id] {
        let err = u
            .compare(&ctx, &CompareRequest::new([done.node_id, pending]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotComparableYet);
        assert!(err.is_retryable());
    }

    let err = u
        .compare(&ctx, &CompareRequest::new([done.node_id, NodeId::new()]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
