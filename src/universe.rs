//! The assembled core: stores, fork service, scheduler, replay and comparison
//! wired together over one set of storage backends.

use std::sync::Arc;

use crate::compare::{CompareRequest, ComparisonEngine, ComparisonReport};
use crate::config::UniverseConfig;
use crate::context::RequestContext;
use crate::error::UniverseResult;
use crate::fork::{ForkRequest, ForkService};
use crate::ids::{NodeId, RunId};
use crate::node::{EdgeVisibility, Node, UniverseMap};
use crate::replay::{ReplayService, TelemetrySlice, TickRange};
use crate::run::{Run, RunConfig};
use crate::scheduler::{RunHandle, RunScheduler, TickExecutor};
use crate::storage::{InMemoryStores, NodeStore, RunStore, TelemetryLogStore};
use crate::telemetry::{EventOccurrence, TelemetryRecorder, TelemetrySummary};

#[cfg(feature = "persistent")]
use crate::storage::persistent::{PersistentConfig, PersistentStores, RecoveryReport};

/// Entry point embedding the whole core.
pub struct Universe {
    config: UniverseConfig,
    forks: ForkService,
    scheduler: RunScheduler,
    recorder: Arc<TelemetryRecorder>,
    replay: Arc<ReplayService>,
    comparison: ComparisonEngine,
    #[cfg(feature = "persistent")]
    _persistent: Option<PersistentStores>,
}

impl Universe {
    /// Wires the core over caller-supplied stores.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad config; `Internal` if workers cannot spawn.
    pub fn with_stores(
        nodes: Arc<dyn NodeStore>,
        runs: Arc<dyn RunStore>,
        logs: Arc<dyn TelemetryLogStore>,
        executor: Arc<dyn TickExecutor>,
        config: UniverseConfig,
    ) -> UniverseResult<Self> {
        let config = config.validate()?;
        let recorder = Arc::new(TelemetryRecorder::new(Arc::clone(&runs), Arc::clone(&logs)));
        let replay = Arc::new(ReplayService::new(Arc::clone(&runs), logs));
        let scheduler = RunScheduler::new(
            Arc::clone(&nodes),
            Arc::clone(&runs),
            Arc::clone(&recorder),
            executor,
            config.clone(),
        )?;
        tracing::debug!(
            workers = config.scheduler.workers,
            queue_capacity = config.scheduler.queue_capacity,
            keyframe_interval = config.keyframe_interval,
            "universe core started"
        );
        Ok(Self {
            forks: ForkService::new(Arc::clone(&nodes), config.fork_max_retries),
            comparison: ComparisonEngine::new(nodes, runs, Arc::clone(&replay)),
            scheduler,
            recorder,
            replay,
            config,
            #[cfg(feature = "persistent")]
            _persistent: None,
        })
    }

    /// A core over fresh in-memory stores.
    ///
    /// # Errors
    ///
    /// As [`Universe::with_stores`].
    pub fn in_memory(executor: Arc<dyn TickExecutor>, config: UniverseConfig) -> UniverseResult<Self> {
        let stores = InMemoryStores::new();
        Self::with_stores(stores.nodes, stores.runs, stores.telemetry, executor, config)
    }

    /// A core over a persistent data directory.
    ///
    /// The directory stays locked until the returned value is dropped.
    ///
    /// # Errors
    ///
    /// As [`PersistentStores::open`] and [`Universe::with_stores`].
    #[cfg(feature = "persistent")]
    pub fn open(
        dir: impl AsRef<std::path::Path>,
        executor: Arc<dyn TickExecutor>,
        config: UniverseConfig,
        persistent: PersistentConfig,
    ) -> UniverseResult<(Self, RecoveryReport)> {
        let (stores, report) = PersistentStores::open(dir.as_ref(), persistent)?;
        let mut universe = Self::with_stores(
            stores.nodes.clone(),
            stores.runs.clone(),
            stores.telemetry.clone(),
            executor,
            config,
        )?;
        universe._persistent = Some(stores);
        Ok((universe, report))
    }

    /// Configuration the universe was built with.
    #[must_use]
    pub const fn config(&self) -> &UniverseConfig {
        &self.config
    }

    /// Node creation and map reads.
    #[must_use]
    pub const fn forks(&self) -> &ForkService {
        &self.forks
    }

    /// Run lifecycle.
    #[must_use]
    pub const fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    /// The recorder shared with the scheduler's workers.
    #[must_use]
    pub fn recorder(&self) -> &TelemetryRecorder {
        &self.recorder
    }

    /// Telemetry reads.
    #[must_use]
    pub fn replay(&self) -> &ReplayService {
        &self.replay
    }

    /// Outcome comparison.
    #[must_use]
    pub const fn comparison(&self) -> &ComparisonEngine {
        &self.comparison
    }

    /// See [`ForkService::fork`].
    ///
    /// # Errors
    ///
    /// As [`ForkService::fork`].
    pub fn fork(&self, ctx: &RequestContext, request: ForkRequest) -> UniverseResult<Node> {
        self.forks.fork(ctx, request)
    }

    /// See [`ForkService::get_node`].
    ///
    /// # Errors
    ///
    /// As [`ForkService::get_node`].
    pub fn get_node(&self, ctx: &RequestContext, node_id: NodeId) -> UniverseResult<Node> {
        self.forks.get_node(ctx, node_id)
    }

    /// See [`ForkService::get_universe_map`].
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub fn get_universe_map(
        &self,
        ctx: &RequestContext,
        policy: &dyn EdgeVisibility,
    ) -> UniverseResult<UniverseMap> {
        self.forks.get_universe_map(ctx, policy)
    }

    /// Forks a node for a scenario and enqueues its run.
    ///
    /// The run is left `queued`; call [`Universe::start`] to execute it.
    ///
    /// # Errors
    ///
    /// As [`ForkService::fork`] and [`RunScheduler::enqueue`]. A failed
    /// enqueue leaves the forked node in place without a run.
    pub fn execute_scenario(
        &self,
        ctx: &RequestContext,
        request: ForkRequest,
        seed: u64,
        total_ticks: u64,
    ) -> UniverseResult<(Node, Run)> {
        let node = self.forks.fork(ctx, request)?;
        let run = self
            .scheduler
            .enqueue(ctx, RunConfig::new(node.node_id, seed, total_ticks))?;
        Ok((node, run))
    }

    /// See [`RunScheduler::enqueue`].
    ///
    /// # Errors
    ///
    /// As [`RunScheduler::enqueue`].
    pub fn enqueue(&self, ctx: &RequestContext, config: RunConfig) -> UniverseResult<Run> {
        self.scheduler.enqueue(ctx, config)
    }

    /// See [`RunScheduler::start`].
    ///
    /// # Errors
    ///
    /// As [`RunScheduler::start`].
    pub fn start(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<RunHandle> {
        self.scheduler.start(ctx, run_id)
    }

    /// See [`RunScheduler::cancel`].
    ///
    /// # Errors
    ///
    /// As [`RunScheduler::cancel`].
    pub fn cancel(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        self.scheduler.cancel(ctx, run_id)
    }

    /// See [`RunScheduler::status`].
    ///
    /// # Errors
    ///
    /// As [`RunScheduler::status`].
    pub fn run_status(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        self.scheduler.status(ctx, run_id)
    }

    /// See [`ReplayService::get_summary`].
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_summary`].
    pub fn get_summary(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<TelemetrySummary> {
        self.replay.get_summary(ctx, run_id)
    }

    /// See [`ReplayService::get_slice`].
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_slice`].
    pub fn get_slice(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        tick: u64,
    ) -> UniverseResult<TelemetrySlice> {
        self.replay.get_slice(ctx, run_id, tick)
    }

    /// See [`ReplayService::get_metric_series`].
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_metric_series`].
    pub fn get_metric_series(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        metric_key: &str,
        range: TickRange,
    ) -> UniverseResult<Vec<(u64, f64)>> {
        self.replay.get_metric_series(ctx, run_id, metric_key, range)
    }

    /// See [`ReplayService::get_events`].
    ///
    /// # Errors
    ///
    /// As [`ReplayService::get_events`].
    pub fn get_events(
        &self,
        ctx: &RequestContext,
        run_id: RunId,
        range: TickRange,
    ) -> UniverseResult<Vec<EventOccurrence>> {
        self.replay.get_events(ctx, run_id, range)
    }

    /// See [`ComparisonEngine::compare`].
    ///
    /// # Errors
    ///
    /// As [`ComparisonEngine::compare`].
    pub fn compare(
        &self,
        ctx: &RequestContext,
        request: &CompareRequest,
    ) -> UniverseResult<ComparisonReport> {
        self.comparison.compare(ctx, request)
    }

    /// Drains queued runs and joins the workers.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
