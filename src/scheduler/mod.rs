//! Run scheduler: lifecycle state machine plus a bounded worker pool.
//!
//! Each started run is owned by exactly one worker. The worker claims the run
//! (`queued -> starting`), records the initial keyframe, moves it to
//! `running` and then loops over ticks:
//!
//! ```text
//! for tick in 1..=total_ticks {
//!     check cancel flag      // cooperative, tick boundary only
//!     executor.step(..)      // pure computation
//!     recorder.append(..)    // the only durable side effect
//! }
//! ```
//!
//! Every terminal transition is followed by finalizing the telemetry index.

mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use crossbeam_channel::bounded;
use thiserror::Error;

use crate::config::UniverseConfig;
use crate::context::RequestContext;
use crate::error::{ErrorKind, ResourceKind, UniverseError, UniverseResult};
use crate::ids::{NodeId, ProjectId, RunId};
use crate::run::{Run, RunConfig, RunStatus};
use crate::scenario::CompiledScenario;
use crate::storage::{NodeStore, RunStore, StorageError};
use crate::telemetry::{is_keyframe_tick, SimulationState, TelemetryRecorder, TickUpdate};

use self::pool::{Job, WorkerPool};

pub use self::pool::RunHandle;

/// Failure reported by a [`TickExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutorError {
    /// Human-readable cause.
    pub message: String,
}

impl ExecutorError {
    /// Creates an error with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything an executor may read about the run it is computing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// Run being computed.
    pub run_id: RunId,
    /// Node the run belongs to.
    pub node_id: NodeId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Seed for every random choice of the executor.
    pub seed: u64,
    /// Tick budget.
    pub total_ticks: u64,
    /// Ticks between keyframes.
    pub keyframe_interval: u64,
    /// The typed scenario compiled at fork time.
    pub scenario: Option<CompiledScenario>,
}

impl RunContext {
    fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            node_id: run.node_id,
            project_id: run.project_id,
            seed: run.seed,
            total_ticks: run.total_ticks,
            keyframe_interval: run.keyframe_interval,
            scenario: run.scenario.clone(),
        }
    }
}

/// Computes simulation ticks. Implemented outside the core.
///
/// Implementations must be deterministic in `(ctx.seed, ctx.scenario, tick,
/// state)` for replays of the same node to agree.
pub trait TickExecutor: Send + Sync {
    /// State recorded as the tick-0 keyframe.
    fn initial_state(&self, ctx: &RunContext) -> Result<SimulationState, ExecutorError>;

    /// Changes produced by `tick`, given the state after `tick - 1`.
    fn step(
        &self,
        ctx: &RunContext,
        tick: u64,
        state: &SimulationState,
    ) -> Result<TickUpdate, ExecutorError>;
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

fn fail(stage: &str, err: &dyn std::fmt::Display) -> Outcome {
    Outcome::Failed(format!("{stage}: {err}"))
}

/// Shared state between the scheduler front end and its workers.
pub(crate) struct SchedulerCore {
    nodes: Arc<dyn NodeStore>,
    runs: Arc<dyn RunStore>,
    recorder: Arc<TelemetryRecorder>,
    executor: Arc<dyn TickExecutor>,
    config: UniverseConfig,
    cancel_flags: RwLock<HashMap<RunId, Arc<AtomicBool>>>,
}

impl SchedulerCore {
    fn load(&self, run_id: RunId) -> UniverseResult<Run> {
        self.runs
            .get(run_id)?
            .ok_or_else(|| UniverseError::run_not_found(run_id))
    }

    /// Read-modify-write on a run with optimistic retries.
    ///
    /// `change` returns `None` when the stored run needs no update.
    fn update_run<F>(&self, run_id: RunId, mut change: F) -> UniverseResult<Run>
    where
        F: FnMut(&Run) -> UniverseResult<Option<Run>>,
    {
        let attempts = self.config.run_update_max_retries.max(1);
        for attempt in 1..=attempts {
            let current = self.load(run_id)?;
            let Some(next) = change(&current)? else {
                return Ok(current);
            };
            match self.runs.update(next, current.version) {
                Ok(stored) => return Ok(stored),
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(%run_id, attempt, expected, actual, "run update raced; retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }
        tracing::warn!(%run_id, attempts, "run update retries exhausted");
        Err(UniverseError::Conflict {
            resource: ResourceKind::Run,
            id: run_id.to_string(),
            reason: format!("run kept changing; gave up after {attempts} attempts"),
        })
    }

    fn transition(
        &self,
        run_id: RunId,
        target: RunStatus,
        error: Option<&str>,
    ) -> UniverseResult<Run> {
        let run = self.update_run(run_id, |run| {
            if run.status == target {
                return Ok(None);
            }
            let mut next = run.transitioned(target).ok_or_else(|| UniverseError::Conflict {
                resource: ResourceKind::Run,
                id: run_id.to_string(),
                reason: format!("cannot move run from {} to {target}", run.status),
            })?;
            next.error = error.map(str::to_string);
            Ok(Some(next))
        })?;
        tracing::info!(%run_id, status = %run.status, "run transitioned");
        Ok(run)
    }

    fn execute(&self, run_id: RunId, cancel: &AtomicBool) -> UniverseResult<Run> {
        let claimed = match self.transition(run_id, RunStatus::Starting, None) {
            Ok(run) => run,
            Err(err) if err.kind() == ErrorKind::Conflict => {
                // Lost the race against a cancel of the queued run.
                let run = self.load(run_id)?;
                if run.status.is_terminal() {
                    return Ok(run);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let (target, error) = match self.drive(&claimed, cancel) {
            Outcome::Completed => (RunStatus::Succeeded, None),
            Outcome::Cancelled => (RunStatus::Cancelled, None),
            Outcome::Failed(reason) => {
                tracing::warn!(%run_id, %reason, "run failed");
                (RunStatus::Failed, Some(reason))
            }
        };
        let finished = self.settle(run_id, target, error.as_deref());
        let finalized = self.recorder.finalize(run_id);
        if let Err(e) = &finalized {
            tracing::error!(%run_id, error = %e, "telemetry index could not be finalized");
        }
        let finished = finished?;
        finalized?;
        Ok(finished)
    }

    /// Writes the terminal status, falling back to `failed` once if that write
    /// is rejected.
    fn settle(&self, run_id: RunId, target: RunStatus, error: Option<&str>) -> UniverseResult<Run> {
        let err = match self.transition(run_id, target, error) {
            Ok(run) => return Ok(run),
            Err(err) => err,
        };
        tracing::warn!(%run_id, %target, error = %err, "terminal transition rejected; failing run");
        let reason = match error {
            Some(cause) => format!("{cause}; could not record {target}: {err}"),
            None => format!("could not record {target}: {err}"),
        };
        self.transition(run_id, RunStatus::Failed, Some(&reason))
            .map_err(|retry| {
                tracing::error!(
                    %run_id,
                    error = %retry,
                    "run left without a terminal status"
                );
                err
            })
    }

    fn drive(&self, run: &Run, cancel: &AtomicBool) -> Outcome {
        let run_id = run.run_id;
        let ctx = RunContext::from_run(run);
        if cancel.load(Ordering::Acquire) {
            return Outcome::Cancelled;
        }
        let mut state = match self.executor.initial_state(&ctx) {
            Ok(state) => state,
            Err(e) => return fail("initial state", &e),
        };
        if let Err(e) = self.recorder.append_keyframe(run_id, 0, &state, Vec::new()) {
            return fail("record tick 0", &e);
        }
        if let Err(e) = self.update_progress(run_id, 0, true) {
            return fail("mark running", &e);
        }

        for tick in 1..=run.total_ticks {
            if cancel.load(Ordering::Acquire) {
                tracing::info!(%run_id, tick, "cancel observed at tick boundary");
                return Outcome::Cancelled;
            }
            let update = match self.executor.step(&ctx, tick, &state) {
                Ok(update) => update,
                Err(e) => return fail(&format!("tick {tick}"), &e),
            };
            if let Err(e) = update.validate() {
                return fail(&format!("tick {tick}"), &e);
            }
            state.apply(&update);
            let recorded = if is_keyframe_tick(tick, run.keyframe_interval) {
                self.recorder
                    .append_keyframe(run_id, tick, &state, update.events_triggered)
            } else {
                self.recorder.append_delta(run_id, tick, update)
            };
            if let Err(e) = recorded {
                return fail(&format!("record tick {tick}"), &e);
            }
            if let Err(e) = self.update_progress(run_id, tick, false) {
                return fail(&format!("progress tick {tick}"), &e);
            }
        }
        Outcome::Completed
    }

    fn update_progress(&self, run_id: RunId, tick: u64, mark_running: bool) -> UniverseResult<Run> {
        self.update_run(run_id, |run| {
            let mut next = if mark_running {
                run.transitioned(RunStatus::Running)
                    .ok_or_else(|| UniverseError::Conflict {
                        resource: ResourceKind::Run,
                        id: run_id.to_string(),
                        reason: format!("cannot move run from {} to running", run.status),
                    })?
            } else {
                run.clone()
            };
            next.current_tick = tick;
            Ok(Some(next))
        })
    }

    fn release(&self, run_id: RunId) {
        if let Ok(mut flags) = self.cancel_flags.write() {
            flags.remove(&run_id);
        }
    }
}

/// Front end of the run lifecycle.
pub struct RunScheduler {
    core: Arc<SchedulerCore>,
    pool: Mutex<Option<WorkerPool>>,
}

impl RunScheduler {
    /// Creates the scheduler and spawns its workers.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        runs: Arc<dyn RunStore>,
        recorder: Arc<TelemetryRecorder>,
        executor: Arc<dyn TickExecutor>,
        config: UniverseConfig,
    ) -> UniverseResult<Self> {
        let workers = config.scheduler.workers;
        let capacity = config.scheduler.queue_capacity;
        let core = Arc::new(SchedulerCore {
            nodes,
            runs,
            recorder,
            executor,
            config,
            cancel_flags: RwLock::new(HashMap::new()),
        });
        let pool = WorkerPool::start(workers, capacity, &core)?;
        Ok(Self {
            core,
            pool: Mutex::new(Some(pool)),
        })
    }

    fn load_scoped(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        self.core
            .runs
            .get(run_id)?
            .filter(|run| ctx.owns(run.project_id))
            .ok_or_else(|| UniverseError::run_not_found(run_id))
    }

    /// Creates the node's run in `queued`.
    ///
    /// # Errors
    ///
    /// - `Validation` for a zero seed, tick count or interval
    /// - `NotFound` if the node is not in the caller's project
    /// - `Conflict` if the node already has a run
    pub fn enqueue(&self, ctx: &RequestContext, config: RunConfig) -> UniverseResult<Run> {
        config.validate()?;
        let node = self
            .core
            .nodes
            .get(config.node_id)?
            .filter(|node| ctx.owns(node.project_id))
            .ok_or_else(|| UniverseError::node_not_found(config.node_id))?;

        let duplicate = || UniverseError::Conflict {
            resource: ResourceKind::Run,
            id: node.run_id.to_string(),
            reason: format!("node {} already has a run", node.node_id),
        };
        if self.core.runs.get(node.run_id)?.is_some() {
            return Err(duplicate());
        }

        let run = Run {
            run_id: node.run_id,
            project_id: node.project_id,
            node_id: node.node_id,
            status: RunStatus::Queued,
            seed: config.seed,
            total_ticks: config.total_ticks,
            current_tick: 0,
            keyframe_interval: config
                .keyframe_interval
                .unwrap_or(self.core.config.keyframe_interval),
            scenario: node.scenario.clone(),
            error: None,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        match self.core.runs.insert(run.clone()) {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => return Err(duplicate()),
            Err(other) => return Err(other.into()),
        }
        tracing::info!(
            project_id = %ctx.project_id,
            request_id = %ctx.request_id,
            run_id = %run.run_id,
            node_id = %run.node_id,
            total_ticks = run.total_ticks,
            keyframe_interval = run.keyframe_interval,
            "run queued"
        );
        Ok(run)
    }

    /// Hands a queued run to the worker pool.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the run is not queued or was already started
    /// - `QueueFull` (retryable) if the pool is saturated; the run stays queued
    /// - `Disconnected` after [`RunScheduler::shutdown`]
    pub fn start(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<RunHandle> {
        let run = self.load_scoped(ctx, run_id)?;
        if run.status != RunStatus::Queued {
            return Err(UniverseError::Conflict {
                resource: ResourceKind::Run,
                id: run_id.to_string(),
                reason: format!("run is {}, only queued runs can start", run.status),
            });
        }

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut flags = self
                .core
                .cancel_flags
                .write()
                .map_err(|_| UniverseError::internal("poisoned lock: scheduler.cancel_flags"))?;
            if flags.contains_key(&run_id) {
                return Err(UniverseError::Conflict {
                    resource: ResourceKind::Run,
                    id: run_id.to_string(),
                    reason: "run was already started".to_string(),
                });
            }
            flags.insert(run_id, Arc::clone(&cancel));
        }

        let (reply, rx) = bounded(1);
        let submitted = {
            let pool = self
                .pool
                .lock()
                .map_err(|_| UniverseError::internal("poisoned lock: scheduler.pool"))?;
            match pool.as_ref() {
                Some(pool) => pool.try_submit(Job::Execute {
                    run_id,
                    cancel,
                    reply,
                }),
                None => Err(UniverseError::Disconnected {
                    component: "run worker pool",
                }),
            }
        };
        if let Err(err) = submitted {
            self.core.release(run_id);
            tracing::warn!(%run_id, error = %err, "run could not be submitted");
            return Err(err);
        }
        tracing::debug!(%run_id, "run submitted to worker pool");
        Ok(RunHandle::new(run_id, rx))
    }

    /// Requests cancellation.
    ///
    /// A queued run is cancelled immediately and never records telemetry. A
    /// starting or running run stops at its next tick boundary; the returned
    /// run may still show the pre-cancel status. Cancelling a terminal run
    /// returns it unchanged.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run is not in the caller's project.
    pub fn cancel(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        let run = self.load_scoped(ctx, run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        if let Some(flag) = self
            .core
            .cancel_flags
            .read()
            .map_err(|_| UniverseError::internal("poisoned lock: scheduler.cancel_flags"))?
            .get(&run_id)
        {
            flag.store(true, Ordering::Release);
        }

        if run.status == RunStatus::Queued {
            let updated = self.core.update_run(run_id, |current| {
                if current.status != RunStatus::Queued {
                    return Ok(None);
                }
                Ok(current.transitioned(RunStatus::Cancelled))
            })?;
            if updated.status == RunStatus::Cancelled {
                self.core.recorder.finalize(run_id)?;
                tracing::info!(
                    request_id = %ctx.request_id,
                    %run_id,
                    "queued run cancelled"
                );
                return Ok(updated);
            }
        }

        tracing::info!(request_id = %ctx.request_id, %run_id, "cancel requested");
        self.load_scoped(ctx, run_id)
    }

    /// Current state of a run.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run is not in the caller's project.
    pub fn status(&self, ctx: &RequestContext, run_id: RunId) -> UniverseResult<Run> {
        self.load_scoped(ctx, run_id)
    }

    /// All runs of the caller's project, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub fn list_runs(&self, ctx: &RequestContext) -> UniverseResult<Vec<Run>> {
        Ok(self.core.runs.list_by_project(ctx.project_id)?)
    }

    /// Stops accepting runs, lets workers drain queued jobs, and joins them.
    pub fn shutdown(&self) {
        let pool = match self.pool.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(pool) = pool {
            pool.shutdown();
            tracing::debug!("run scheduler shut down");
        }
    }
}

impl Drop for RunScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RunScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScheduler")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::{Receiver, Sender};

    use super::*;
    use crate::fork::{ForkRequest, ForkService};
    use crate::storage::{InMemoryNodeStore, InMemoryRunStore, InMemoryTelemetryStore, TelemetryLogStore};
    use crate::telemetry::EventSignal;

    /// Adds one to metric `n` every tick.
    struct Counter;

    impl TickExecutor for Counter {
        fn initial_state(&self, _ctx: &RunContext) -> Result<SimulationState, ExecutorError> {
            let mut state = SimulationState::new();
            state.metrics.insert("n".to_string(), 0.0);
            Ok(state)
        }

        fn step(
            &self,
            _ctx: &RunContext,
            _tick: u64,
            state: &SimulationState,
        ) -> Result<TickUpdate, ExecutorError> {
            let mut update = TickUpdate::default();
            update
                .metrics
                .insert("n".to_string(), state.metrics.get("n").copied().unwrap_or(0.0) + 1.0);
            Ok(update)
        }
    }

    /// Fails on a chosen tick.
    struct FailAt(u64);

    impl TickExecutor for FailAt {
        fn initial_state(&self, ctx: &RunContext) -> Result<SimulationState, ExecutorError> {
            Counter.initial_state(ctx)
        }

        fn step(
            &self,
            ctx: &RunContext,
            tick: u64,
            state: &SimulationState,
        ) -> Result<TickUpdate, ExecutorError> {
            if tick == self.0 {
                return Err(ExecutorError::new("agent model diverged"));
            }
            Counter.step(ctx, tick, state)
        }
    }

    /// Blocks in `initial_state` until released.
    struct Gate {
        entered: Sender<()>,
        release: Mutex<Receiver<()>>,
    }

    impl TickExecutor for Gate {
        fn initial_state(&self, ctx: &RunContext) -> Result<SimulationState, ExecutorError> {
            let _ = self.entered.send(());
            if let Ok(release) = self.release.lock() {
                let _ = release.recv();
            }
            Counter.initial_state(ctx)
        }

        fn step(
            &self,
            ctx: &RunContext,
            tick: u64,
            state: &SimulationState,
        ) -> Result<TickUpdate, ExecutorError> {
            Counter.step(ctx, tick, state)
        }
    }

    struct Harness {
        forks: ForkService,
        scheduler: RunScheduler,
        logs: Arc<InMemoryTelemetryStore>,
        ctx: RequestContext,
    }

    /// Rejects every write that would mark a run succeeded.
    struct RefuseSuccess(InMemoryRunStore);

    impl RunStore for RefuseSuccess {
        fn insert(&self, run: Run) -> Result<(), StorageError> {
            self.0.insert(run)
        }

        fn get(&self, id: RunId) -> Result<Option<Run>, StorageError> {
            self.0.get(id)
        }

        fn update(&self, run: Run, expected_version: u64) -> Result<Run, StorageError> {
            if run.status == RunStatus::Succeeded {
                return Err(StorageError::BackendError("disk full".to_string()));
            }
            self.0.update(run, expected_version)
        }

        fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Run>, StorageError> {
            self.0.list_by_project(project_id)
        }
    }

    /// Emits a non-finite event intensity on a chosen tick.
    struct BadSignalAt(u64);

    impl TickExecutor for BadSignalAt {
        fn initial_state(&self, ctx: &RunContext) -> Result<SimulationState, ExecutorError> {
            Counter.initial_state(ctx)
        }

        fn step(
            &self,
            ctx: &RunContext,
            tick: u64,
            state: &SimulationState,
        ) -> Result<TickUpdate, ExecutorError> {
            let mut update = Counter.step(ctx, tick, state)?;
            if tick == self.0 {
                update.events_triggered.push(EventSignal {
                    event_id: "shock".to_string(),
                    intensity: f64::NAN,
                    affected_agents: Vec::new(),
                    ended: false,
                });
            }
            Ok(update)
        }
    }

    fn harness(executor: Arc<dyn TickExecutor>, workers: usize, queue_capacity: usize) -> Harness {
        harness_with_runs(executor, Arc::new(InMemoryRunStore::new()), workers, queue_capacity)
    }

    fn harness_with_runs(
        executor: Arc<dyn TickExecutor>,
        runs: Arc<dyn RunStore>,
        workers: usize,
        queue_capacity: usize,
    ) -> Harness {
        let nodes = Arc::new(InMemoryNodeStore::new());
        let logs = Arc::new(InMemoryTelemetryStore::new());
        let recorder = Arc::new(TelemetryRecorder::new(runs.clone(), logs.clone()));
        let mut config = UniverseConfig::default();
        config.scheduler.workers = workers;
        config.scheduler.queue_capacity = queue_capacity;
        Harness {
            forks: ForkService::new(nodes.clone(), 8),
            scheduler: RunScheduler::new(nodes, runs, recorder, executor, config).unwrap(),
            logs,
            ctx: RequestContext::new(ProjectId::new()),
        }
    }

    fn queued(h: &Harness, ticks: u64, interval: u64) -> Run {
        let node = h.forks.fork(&h.ctx, ForkRequest::root()).unwrap();
        h.scheduler
            .enqueue(
                &h.ctx,
                RunConfig::new(node.node_id, 42, ticks).with_keyframe_interval(interval),
            )
            .unwrap()
    }

    #[test]
    fn run_succeeds_and_finalizes_index() {
        let h = harness(Arc::new(Counter), 2, 8);
        let run = queued(&h, 25, 10);
        assert_eq!(run.status, RunStatus::Queued);

        let done = h
            .scheduler
            .start(&h.ctx, run.run_id)
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.current_tick, 25);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        let index = h.logs.index(run.run_id).unwrap().unwrap();
        assert!(index.finalized);
        assert_eq!(index.keyframe_ticks, vec![0, 10, 20]);
        assert_eq!(index.last_tick, Some(25));
    }

    #[test]
    fn second_enqueue_for_node_conflicts() {
        let h = harness(Arc::new(Counter), 1, 4);
        let run = queued(&h, 5, 5);
        let err = h
            .scheduler
            .enqueue(&h.ctx, RunConfig::new(run.node_id, 7, 5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn enqueue_validates_config() {
        let h = harness(Arc::new(Counter), 1, 4);
        let node = h.forks.fork(&h.ctx, ForkRequest::root()).unwrap();
        let err = h
            .scheduler
            .enqueue(&h.ctx, RunConfig::new(node.node_id, 0, 5))
            .unwrap_err();
        assert!(err.is_validation());
        let err = h
            .scheduler
            .enqueue(&h.ctx, RunConfig::new(NodeId::new(), 1, 5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn cancel_while_queued_leaves_no_telemetry() {
        let h = harness(Arc::new(Counter), 1, 4);
        let run = queued(&h, 5, 5);
        let cancelled = h.scheduler.cancel(&h.ctx, run.run_id).unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(h.logs.index(run.run_id).unwrap().is_none());

        // Terminal runs are returned unchanged and cannot start.
        let again = h.scheduler.cancel(&h.ctx, run.run_id).unwrap();
        assert_eq!(again, cancelled);
        assert_eq!(
            h.scheduler.start(&h.ctx, run.run_id).unwrap_err().kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn executor_failure_keeps_recorded_ticks() {
        let h = harness(Arc::new(FailAt(7)), 1, 4);
        let run = queued(&h, 20, 5);
        let done = h
            .scheduler
            .start(&h.ctx, run.run_id)
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap_or_default().contains("diverged"));
        assert_eq!(done.current_tick, 6);

        let index = h.logs.index(run.run_id).unwrap().unwrap();
        assert!(index.finalized);
        assert_eq!(index.last_tick, Some(6));
    }

    #[test]
    fn full_queue_rejects_and_leaves_run_queued() {
        let (entered_tx, entered_rx) = bounded(4);
        let (release_tx, release_rx) = bounded(4);
        let gate = Arc::new(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        let h = harness(gate, 1, 1);
        let a = queued(&h, 3, 5);
        let b = queued(&h, 3, 5);
        let c = queued(&h, 3, 5);

        let handle_a = h.scheduler.start(&h.ctx, a.run_id).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let handle_b = h.scheduler.start(&h.ctx, b.run_id).unwrap();

        let err = h.scheduler.start(&h.ctx, c.run_id).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, UniverseError::QueueFull { capacity: 1 }));
        assert_eq!(
            h.scheduler.status(&h.ctx, c.run_id).unwrap().status,
            RunStatus::Queued
        );

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(
            handle_a.join_timeout(Duration::from_secs(5)).unwrap().status,
            RunStatus::Succeeded
        );
        assert_eq!(
            handle_b.join_timeout(Duration::from_secs(5)).unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[test]
    fn cancel_while_starting_stops_at_tick_boundary() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let gate = Arc::new(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        let h = harness(gate, 1, 2);
        let run = queued(&h, 50, 10);

        let handle = h.scheduler.start(&h.ctx, run.run_id).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let seen = h.scheduler.cancel(&h.ctx, run.run_id).unwrap();
        assert_eq!(seen.status, RunStatus::Starting);
        release_tx.send(()).unwrap();

        let done = handle.join_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        // Tick 0 was recorded before the first boundary check after it.
        let index = h.logs.index(run.run_id).unwrap().unwrap();
        assert_eq!(index.last_tick, Some(0));
        assert!(index.finalized);
    }

    #[test]
    fn rejected_success_write_fails_run_and_still_finalizes() {
        let h = harness_with_runs(
            Arc::new(Counter),
            Arc::new(RefuseSuccess(InMemoryRunStore::new())),
            1,
            2,
        );
        let run = queued(&h, 7, 5);

        let done = h
            .scheduler
            .start(&h.ctx, run.run_id)
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("could not record succeeded"));
        assert_eq!(done.current_tick, 7);

        let index = h.logs.index(run.run_id).unwrap().unwrap();
        assert!(index.finalized);
        assert_eq!(index.last_tick, Some(7));
    }

    #[test]
    fn non_finite_signal_fails_run_at_that_tick() {
        let h = harness(Arc::new(BadSignalAt(5)), 1, 2);
        let run = queued(&h, 12, 5);

        let done = h
            .scheduler
            .start(&h.ctx, run.run_id)
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("tick 5"));
        assert_eq!(done.current_tick, 4);

        let index = h.logs.index(run.run_id).unwrap().unwrap();
        assert!(index.finalized);
        assert_eq!(index.last_tick, Some(4));
        assert_eq!(index.keyframe_ticks, vec![0]);
    }

    #[test]
    fn start_after_shutdown_is_disconnected() {
        let h = harness(Arc::new(Counter), 1, 4);
        let run = queued(&h, 5, 5);
        h.scheduler.shutdown();
        let err = h.scheduler.start(&h.ctx, run.run_id).unwrap_err();
        assert!(matches!(err, UniverseError::Disconnected { .. }));
        assert_eq!(
            h.scheduler.status(&h.ctx, run.run_id).unwrap().status,
            RunStatus::Queued
        );
    }

    #[test]
    fn runs_are_project_scoped() {
        let h = harness(Arc::new(Counter), 1, 4);
        let run = queued(&h, 5, 5);
        let stranger = RequestContext::new(ProjectId::new());
        assert_eq!(
            h.scheduler.status(&stranger, run.run_id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(h.scheduler.list_runs(&stranger).unwrap().is_empty());
        assert_eq!(h.scheduler.list_runs(&h.ctx).unwrap().len(), 1);
    }
}
