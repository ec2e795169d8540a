//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use universe_core::{
    AgentUpdate, ConfidenceLevel, CompiledScenario, EventSignal, ExecutorError, ForkRequest,
    InMemoryStores, Node, ProjectId, RequestContext, Run, RunContext, ScenarioKind,
    SimulationState, TickExecutor, TickUpdate, Universe, UniverseConfig,
};

pub const AGENTS: u64 = 3;

/// Deterministic toy economy driven by a seeded LCG.
///
/// `gdp` moves every tick, `unemployment` every fourth tick, and a `shock`
/// event runs from tick 5 to tick 12 of every 20.
#[derive(Debug, Default)]
pub struct LcgEconomy;

fn noise(seed: u64, tick: u64) -> u64 {
    let mut x = seed
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(tick.wrapping_mul(1_442_695_040_888_963_407));
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^ (x >> 33)
}

fn bias(ctx: &RunContext) -> f64 {
    match ctx.scenario.as_ref().map(|s| &s.kind) {
        Some(ScenarioKind::Variable { variable_deltas }) => variable_deltas.values().sum(),
        _ => 0.0,
    }
}

fn agent(i: u64) -> String {
    format!("agent-{i}")
}

impl TickExecutor for LcgEconomy {
    fn initial_state(&self, _ctx: &RunContext) -> Result<SimulationState, ExecutorError> {
        let mut state = SimulationState::new();
        for i in 0..AGENTS {
            let mut fields = serde_json::Map::new();
            fields.insert("wealth".to_string(), json!(100));
            state.agents.insert(agent(i), fields);
        }
        state.metrics.insert("gdp".to_string(), 100.0);
        state.metrics.insert("unemployment".to_string(), 5.0);
        Ok(state)
    }

    fn step(
        &self,
        ctx: &RunContext,
        tick: u64,
        state: &SimulationState,
    ) -> Result<TickUpdate, ExecutorError> {
        let r = noise(ctx.seed, tick);
        let gdp = state.metrics.get("gdp").copied().unwrap_or(0.0);

        let mut update = TickUpdate::default();
        #[allow(clippy::cast_precision_loss)]
        let step = (r % 5) as f64 - 2.0 + bias(ctx);
        update.metrics.insert("gdp".to_string(), gdp + step);
        if tick % 4 == 0 {
            let unemployment = state.metrics.get("unemployment").copied().unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let shift = ((r >> 8) % 3) as f64 - 1.0;
            update
                .metrics
                .insert("unemployment".to_string(), unemployment + shift);
        }

        let mut fields = serde_json::Map::new();
        fields.insert("wealth".to_string(), json!(r % 1000));
        update.agent_updates.push(AgentUpdate {
            agent_id: agent(tick % AGENTS),
            fields,
        });

        match tick % 20 {
            5 | 12 => update.events_triggered.push(EventSignal {
                event_id: "shock".to_string(),
                intensity: 0.5,
                affected_agents: vec![agent(tick % AGENTS)],
                ended: tick % 20 == 12,
            }),
            _ => {}
        }
        Ok(update)
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new(ProjectId::new())
}

pub fn universe() -> Universe {
    Universe::in_memory(Arc::new(LcgEconomy), UniverseConfig::default()).unwrap()
}

/// A universe plus direct handles on its stores.
pub fn universe_with_stores() -> (Universe, InMemoryStores) {
    let stores = InMemoryStores::new();
    let universe = Universe::with_stores(
        stores.nodes.clone(),
        stores.runs.clone(),
        stores.telemetry.clone(),
        Arc::new(LcgEconomy),
        UniverseConfig::default(),
    )
    .unwrap();
    (universe, stores)
}

pub fn variable_scenario(variable: &str, delta: f64, adjustment: f64) -> CompiledScenario {
    let mut deltas = std::collections::BTreeMap::new();
    deltas.insert(variable.to_string(), delta);
    CompiledScenario::compile(
        ScenarioKind::Variable {
            variable_deltas: deltas,
        },
        adjustment,
        ConfidenceLevel::Medium,
        delta.abs(),
    )
    .unwrap()
}

pub fn finish(universe: &Universe, ctx: &RequestContext, run: &Run) -> Run {
    universe
        .start(ctx, run.run_id)
        .unwrap()
        .join_timeout(Duration::from_secs(10))
        .unwrap()
}

/// Forks a node for `request`, runs it to completion and returns both.
pub fn executed(
    universe: &Universe,
    ctx: &RequestContext,
    request: ForkRequest,
    seed: u64,
    ticks: u64,
) -> (Node, Run) {
    let (node, run) = universe.execute_scenario(ctx, request, seed, ticks).unwrap();
    let done = finish(universe, ctx, &run);
    (node, done)
}
