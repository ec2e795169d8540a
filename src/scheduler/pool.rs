//! Bounded thread pool executing started runs.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{UniverseError, UniverseResult};
use crate::ids::RunId;
use crate::run::Run;

use super::SchedulerCore;

pub(super) enum Job {
    Execute {
        run_id: RunId,
        cancel: Arc<AtomicBool>,
        reply: Sender<UniverseResult<Run>>,
    },
}

pub(super) struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    pub(super) fn start(
        workers: usize,
        queue_capacity: usize,
        core: &Arc<SchedulerCore>,
    ) -> UniverseResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let core = Arc::clone(core);
            let handle = thread::Builder::new()
                .name(format!("universe-run-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job {
                            Job::Execute {
                                run_id,
                                cancel,
                                reply,
                            } => {
                                let result = core.execute(run_id, &cancel);
                                core.release(run_id);
                                let _ = reply.send(result);
                            }
                        }
                    }
                })
                .map_err(|e| UniverseError::internal(format!("failed to spawn run worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx,
            workers: handles,
            queue_capacity,
        })
    }

    pub(super) fn try_submit(&self, job: Job) -> UniverseResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(UniverseError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(UniverseError::Disconnected {
                component: "run worker pool",
            }),
        }
    }

    pub(super) fn shutdown(self) {
        // Close the channel: workers will drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Handle returned by [`super::RunScheduler::start`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    rx: Receiver<UniverseResult<Run>>,
}

impl RunHandle {
    pub(super) const fn new(run_id: RunId, rx: Receiver<UniverseResult<Run>>) -> Self {
        Self { run_id, rx }
    }

    /// Run this handle waits on.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Waits for the run to reach a terminal state.
    ///
    /// # Errors
    ///
    /// The worker's error, or `Disconnected` if the worker died.
    pub fn join(self) -> UniverseResult<Run> {
        self.rx.recv().map_err(|_| UniverseError::Disconnected {
            component: "run worker",
        })?
    }

    /// Waits for the run to reach a terminal state, up to `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if the run is still executing, otherwise as [`RunHandle::join`].
    pub fn join_timeout(self, timeout: Duration) -> UniverseResult<Run> {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        let run_id = self.run_id;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => UniverseError::Timeout {
                run_id,
                duration_ms,
            },
            RecvTimeoutError::Disconnected => UniverseError::Disconnected {
                component: "run worker",
            },
        })?
    }
}
