//! Durable stores survive a restart with identical replay results.

#![cfg(feature = "persistent")]

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tempfile::tempdir;
use universe_core::storage::persistent::PersistentConfig;
use universe_core::{ErrorKind, ForkRequest, RunStatus, ShowAllEdges, Universe, UniverseConfig};

use common::{ctx, executed, LcgEconomy};

fn open(dir: &std::path::Path) -> Universe {
    let (universe, _) = Universe::open(
        dir,
        Arc::new(LcgEconomy),
        UniverseConfig::default(),
        PersistentConfig {
            sync_on_write: false,
        },
    )
    .unwrap();
    universe
}

#[test]
fn map_runs_and_slices_survive_reopen() {
    let dir = tempdir().unwrap();
    let ctx = ctx();

    let (root, child, run, fingerprints) = {
        let u = open(dir.path());
        let root = u.fork(&ctx, ForkRequest::root().with_label("today")).unwrap();
        let (child, run) = executed(
            &u,
            &ctx,
            ForkRequest::child_of(root.node_id)
                .with_scenario(common::variable_scenario("rate", 0.5, 0.6)),
            31,
            35,
        );
        let fingerprints: Vec<String> = (0..=35)
            .map(|t| u.get_slice(&ctx, run.run_id, t).unwrap().fingerprint().unwrap())
            .collect();
        u.shutdown();
        (root, child, run, fingerprints)
    };

    let u = open(dir.path());
    let map = u.get_universe_map(&ctx, &ShowAllEdges).unwrap();
    assert_eq!(map.nodes.len(), 2);
    assert_eq!(u.get_node(&ctx, root.node_id).unwrap().child_count, 1);
    assert!(u.get_node(&ctx, child.node_id).unwrap().same_identity(&child));

    let reloaded = u.run_status(&ctx, run.run_id).unwrap();
    assert_eq!(reloaded.status, RunStatus::Succeeded);
    assert_eq!(reloaded.current_tick, 35);

    let summary = u.get_summary(&ctx, run.run_id).unwrap();
    assert!(summary.finalized);
    assert_eq!(summary.total_ticks, 35);
    for (tick, expected) in (0..=35).zip(&fingerprints) {
        assert_eq!(
            &u.get_slice(&ctx, run.run_id, tick).unwrap().fingerprint().unwrap(),
            expected
        );
    }

    // the run is bound to its node for good
    assert_eq!(
        u.enqueue(&ctx, universe_core::RunConfig::new(child.node_id, 1, 5))
            .unwrap_err()
            .kind(),
        ErrorKind::Conflict
    );
}

#[test]
fn torn_log_tail_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    let ctx = ctx();

    let (run, before) = {
        let u = open(dir.path());
        let (_, run) = executed(&u, &ctx, ForkRequest::root(), 8, 20);
        let before = u.get_slice(&ctx, run.run_id, 20).unwrap();
        (run, before)
    };

    let log = dir.path().join("telemetry").join(format!("{}.log", run.run_id));
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[1, 200, 0, 0, 0, b'{']).unwrap();
    drop(file);

    let u = open(dir.path());
    assert_eq!(u.get_slice(&ctx, run.run_id, 20).unwrap(), before);
    assert!(u.get_summary(&ctx, run.run_id).unwrap().finalized);
    assert!(u.get_slice(&ctx, run.run_id, 21).unwrap_err().is_validation());
}
