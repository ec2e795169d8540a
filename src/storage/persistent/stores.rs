//! Persistent store implementations.
//!
//! Node and run stores keep their full state in memory and journal every
//! mutation to the shared WAL before applying it. Telemetry lives in per-run
//! log files (see [`super::logs`]).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{UniverseError, UniverseResult};
use crate::ids::{NodeId, ProjectId, RunId};
use crate::node::Node;
use crate::run::{Run, RunStatus};
use crate::storage::lock_err;
use crate::storage::memory::{NodeState, RunState};
use crate::storage::traits::{NodeStore, RunStore, StorageError, TelemetryLogStore};

use super::dir_lock::DataDirLock;
use super::logs::PersistentTelemetryStore;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// Failure reason stamped on runs found mid-execution when a store is opened.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

fn wal_err(e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("WAL write failed: {e}"))
}

fn storage(context: &str, e: impl std::fmt::Display) -> UniverseError {
    UniverseError::Storage {
        message: format!("{context}: {e}"),
    }
}

/// Aggregate type containing all persistent stores.
///
/// This is the primary entry point for persistent storage.
#[derive(Debug)]
pub struct PersistentStores {
    /// The data directory.
    pub dir: PathBuf,
    /// Held for as long as the stores are open.
    _lock: DataDirLock,
    /// Write-ahead log for durability.
    wal: Arc<WriteAheadLog>,

    /// Journaled node store.
    pub nodes: Arc<PersistentNodeStore>,
    /// Journaled run store.
    pub runs: Arc<PersistentRunStore>,
    /// Per-run telemetry logs.
    pub telemetry: Arc<PersistentTelemetryStore>,
}

/// What [`PersistentStores::open`] found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// WAL entries replayed.
    pub wal_entries: u64,
    /// Runs moved to `failed` because they were mid-execution.
    pub interrupted_runs: Vec<RunId>,
    /// Telemetry indexes frozen because their run is terminal.
    pub finalized_logs: Vec<RunId>,
}

impl PersistentStores {
    /// Open or create a persistent data directory.
    ///
    /// Replays the WAL, loads telemetry logs, then fails runs that were
    /// `starting` or `running` when the previous process stopped and freezes
    /// the index of every terminal run.
    ///
    /// # Errors
    /// - If the directory cannot be created or accessed
    /// - If another process holds the lock
    /// - If a WAL entry cannot be applied
    pub fn open(dir: &Path, config: PersistentConfig) -> UniverseResult<(Self, RecoveryReport)> {
        fs::create_dir_all(dir).map_err(|e| storage("failed to create data directory", e))?;

        let lock = DataDirLock::acquire(dir)?;

        let wal = Arc::new(
            WriteAheadLog::open(&dir.join("universe.wal"), config.sync_on_write)
                .map_err(|e| storage("failed to open WAL", e))?,
        );
        let telemetry = Arc::new(PersistentTelemetryStore::open(
            &dir.join("telemetry"),
            config.sync_on_write,
        )?);

        let stores = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            nodes: Arc::new(PersistentNodeStore {
                wal: Arc::clone(&wal),
                state: RwLock::new(NodeState::default()),
            }),
            runs: Arc::new(PersistentRunStore {
                wal: Arc::clone(&wal),
                state: RwLock::new(RunState::default()),
            }),
            wal,
            telemetry,
        };

        let mut report = RecoveryReport {
            wal_entries: stores.replay_wal()?,
            ..RecoveryReport::default()
        };
        stores.recover_runs(&mut report)?;

        tracing::info!(
            dir = %dir.display(),
            wal_entries = report.wal_entries,
            interrupted = report.interrupted_runs.len(),
            finalized = report.finalized_logs.len(),
            "persistent stores opened"
        );
        Ok((stores, report))
    }

    /// Replay WAL entries to restore in-memory state.
    fn replay_wal(&self) -> UniverseResult<u64> {
        let iter = self.wal.iter().map_err(|e| storage("failed to iterate WAL", e))?;
        let mut nodes = self.nodes.state.write().map_err(|_| lock_err("node.replay"))?;
        let mut runs = self.runs.state.write().map_err(|_| lock_err("run.replay"))?;

        let mut count = 0;
        for entry_result in iter {
            let entry = entry_result.map_err(|e| UniverseError::DataIntegrity {
                location: self.dir.join("universe.wal").display().to_string(),
                message: format!("corrupted WAL entry: {e}"),
            })?;

            match entry.kind {
                WalEntryKind::NodeInsert(node) => nodes.insert_root(node)?,
                WalEntryKind::NodeChildForked { child, parent } => {
                    nodes.commit_child(child, parent);
                }
                WalEntryKind::RunInsert(run) => runs.insert(run)?,
                WalEntryKind::RunUpdate(run) => runs.put(run),
            }

            count += 1;
        }

        if count > 0 {
            tracing::debug!(entries = count, nodes = nodes.len(), "replayed WAL");
        }
        Ok(count)
    }

    fn recover_runs(&self, report: &mut RecoveryReport) -> UniverseResult<()> {
        let runs = self
            .runs
            .state
            .read()
            .map_err(|_| lock_err("run.recover"))?
            .all();

        for run in runs {
            let run = if matches!(run.status, RunStatus::Starting | RunStatus::Running) {
                let Some(mut failed) = run.transitioned(RunStatus::Failed) else {
                    continue;
                };
                failed.error = Some(INTERRUPTED_REASON.to_string());
                let failed = self.runs.update(failed, run.version)?;
                tracing::warn!(run_id = %run.run_id, tick = run.current_tick, "run interrupted by restart");
                report.interrupted_runs.push(run.run_id);
                failed
            } else {
                run
            };

            if !run.status.is_terminal() {
                continue;
            }
            if let Some(mut index) = self.telemetry.index(run.run_id)? {
                if !index.finalized {
                    index.freeze();
                    self.telemetry.publish_index(index)?;
                    report.finalized_logs.push(run.run_id);
                }
            }
        }
        Ok(())
    }

    /// Get the WAL file size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }
}

// --- Node Store ---

/// Node store that journals to the WAL before applying.
#[derive(Debug)]
pub struct PersistentNodeStore {
    wal: Arc<WriteAheadLog>,
    state: RwLock<NodeState>,
}

impl NodeStore for PersistentNodeStore {
    fn insert_root(&self, node: Node) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("node.insert_root"))?;
        if state.get(node.node_id).is_some() {
            return Err(StorageError::DuplicateKey(node.node_id.to_string()));
        }
        self.wal
            .append(WalEntryKind::NodeInsert(node.clone()))
            .map_err(|e| wal_err(&e))?;
        state.insert_root(node)
    }

    fn insert_child(&self, child: Node, expected_parent_version: u64) -> Result<Node, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("node.insert_child"))?;
        let parent = state.prepare_child(&child, expected_parent_version)?;
        self.wal
            .append(WalEntryKind::NodeChildForked {
                child: child.clone(),
                parent: parent.clone(),
            })
            .map_err(|e| wal_err(&e))?;
        state.commit_child(child, parent.clone());
        Ok(parent)
    }

    fn get(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("node.get"))?;
        Ok(state.get(id))
    }

    fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Node>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("node.list_by_project"))?;
        Ok(state.list_by_project(project_id))
    }
}

// --- Run Store ---

/// Run store that journals to the WAL before applying.
#[derive(Debug)]
pub struct PersistentRunStore {
    wal: Arc<WriteAheadLog>,
    state: RwLock<RunState>,
}

impl RunStore for PersistentRunStore {
    fn insert(&self, run: Run) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("run.insert"))?;
        if state.get(run.run_id).is_some() {
            return Err(StorageError::DuplicateKey(run.run_id.to_string()));
        }
        self.wal
            .append(WalEntryKind::RunInsert(run.clone()))
            .map_err(|e| wal_err(&e))?;
        state.insert(run)
    }

    fn get(&self, id: RunId) -> Result<Option<Run>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("run.get"))?;
        Ok(state.get(id))
    }

    fn update(&self, run: Run, expected_version: u64) -> Result<Run, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("run.update"))?;
        let next = state.prepare_update(&run, expected_version)?;
        self.wal
            .append(WalEntryKind::RunUpdate(next.clone()))
            .map_err(|e| wal_err(&e))?;
        state.put(next.clone());
        Ok(next)
    }

    fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Run>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("run.list_by_project"))?;
        Ok(state.list_by_project(project_id))
    }
}
