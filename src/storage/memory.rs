//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! The state types are shared with the persistent backend, which replays its
//! journal into them on open.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ResourceKind;
use crate::ids::{NodeId, ProjectId, RunId};
use crate::node::Node;
use crate::run::Run;
use crate::storage::lock_err;
use crate::storage::traits::{NodeStore, RunStore, StorageError, TelemetryLogStore};
use crate::telemetry::TelemetryIndex;

#[derive(Debug, Default)]
pub(crate) struct NodeState {
    by_id: HashMap<NodeId, Node>,
    by_project: HashMap<ProjectId, Vec<NodeId>>,
}

impl NodeState {
    pub(crate) fn insert_root(&mut self, node: Node) -> Result<(), StorageError> {
        if self.by_id.contains_key(&node.node_id) {
            return Err(StorageError::DuplicateKey(node.node_id.to_string()));
        }
        if node.parent_node_id.is_some() {
            return Err(StorageError::BackendError(format!(
                "node {} has a parent and cannot be inserted as a root",
                node.node_id
            )));
        }
        self.by_project
            .entry(node.project_id)
            .or_default()
            .push(node.node_id);
        self.by_id.insert(node.node_id, node);
        Ok(())
    }

    /// Checks that `child` can be inserted under its parent at `expected` and
    /// returns the parent as it will look afterwards. Writes nothing.
    pub(crate) fn prepare_child(&self, child: &Node, expected: u64) -> Result<Node, StorageError> {
        if self.by_id.contains_key(&child.node_id) {
            return Err(StorageError::DuplicateKey(child.node_id.to_string()));
        }
        let parent_id = child.parent_node_id.ok_or_else(|| {
            StorageError::BackendError(format!("node {} has no parent", child.node_id))
        })?;
        let parent = self
            .by_id
            .get(&parent_id)
            .ok_or(StorageError::NodeNotFound(parent_id))?;
        if parent.version != expected {
            return Err(StorageError::VersionConflict {
                resource: ResourceKind::Node,
                id: parent_id.to_string(),
                expected,
                actual: parent.version,
            });
        }
        let mut next = parent.clone();
        next.child_count += 1;
        next.version += 1;
        Ok(next)
    }

    pub(crate) fn commit_child(&mut self, child: Node, parent: Node) {
        self.by_project
            .entry(child.project_id)
            .or_default()
            .push(child.node_id);
        self.by_id.insert(child.node_id, child);
        self.by_id.insert(parent.node_id, parent);
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<Node> {
        self.by_id.get(&id).cloned()
    }

    pub(crate) fn list_by_project(&self, project_id: ProjectId) -> Vec<Node> {
        self.by_project
            .get(&project_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    #[cfg(feature = "persistent")]
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Thread-safe in-memory node store.
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    state: RwLock<NodeState>,
}

impl InMemoryNodeStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for InMemoryNodeStore {
    fn insert_root(&self, node: Node) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("node.insert_root"))?;
        state.insert_root(node)
    }

    fn insert_child(&self, child: Node, expected_parent_version: u64) -> Result<Node, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("node.insert_child"))?;
        let parent = state.prepare_child(&child, expected_parent_version)?;
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

#[derive(Debug, Default)]
pub(crate) struct RunState {
    by_id: HashMap<RunId, Run>,
    by_project: HashMap<ProjectId, Vec<RunId>>,
}

impl RunState {
    pub(crate) fn insert(&mut self, run: Run) -> Result<(), StorageError> {
        if self.by_id.contains_key(&run.run_id) {
            return Err(StorageError::DuplicateKey(run.run_id.to_string()));
        }
        self.by_project
            .entry(run.project_id)
            .or_default()
            .push(run.run_id);
        self.by_id.insert(run.run_id, run);
        Ok(())
    }

    /// Returns the run as it will be stored after a successful update.
    pub(crate) fn prepare_update(&self, run: &Run, expected: u64) -> Result<Run, StorageError> {
        let current = self
            .by_id
            .get(&run.run_id)
            .ok_or(StorageError::RunNotFound(run.run_id))?;
        if current.version != expected {
            return Err(StorageError::VersionConflict {
                resource: ResourceKind::Run,
                id: run.run_id.to_string(),
                expected,
                actual: current.version,
            });
        }
        let mut next = run.clone();
        next.version = expected + 1;
        Ok(next)
    }

    pub(crate) fn put(&mut self, run: Run) {
        self.by_id.insert(run.run_id, run);
    }

    pub(crate) fn get(&self, id: RunId) -> Option<Run> {
        self.by_id.get(&id).cloned()
    }

    pub(crate) fn list_by_project(&self, project_id: ProjectId) -> Vec<Run> {
        self.by_project
            .get(&project_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    #[cfg(feature = "persistent")]
    pub(crate) fn all(&self) -> Vec<Run> {
        self.by_id.values().cloned().collect()
    }
}

/// Thread-safe in-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: RwLock<RunState>,
}

impl InMemoryRunStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, run: Run) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("run.insert"))?;
        state.insert(run)
    }

    fn get(&self, id: RunId) -> Result<Option<Run>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("run.get"))?;
        Ok(state.get(id))
    }

    fn update(&self, run: Run, expected_version: u64) -> Result<Run, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("run.update"))?;
        let next = state.prepare_update(&run, expected_version)?;
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

#[derive(Debug)]
struct MemoryLog {
    bytes: Vec<u8>,
    index: TelemetryIndex,
}

/// Thread-safe in-memory telemetry logs, one byte buffer per run.
#[derive(Debug, Default)]
pub struct InMemoryTelemetryStore {
    logs: RwLock<HashMap<RunId, MemoryLog>>,
}

impl InMemoryTelemetryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held across all logs.
    pub fn total_bytes(&self) -> Result<u64, StorageError> {
        let logs = self.logs.read().map_err(|_| lock_err("telemetry.total_bytes"))?;
        Ok(logs.values().map(|log| log.bytes.len() as u64).sum())
    }
}

pub(crate) fn check_append(
    run_id: RunId,
    current_len: u64,
    appended: usize,
    index: &TelemetryIndex,
) -> Result<(), StorageError> {
    if index.run_id != run_id {
        return Err(StorageError::BackendError(format!(
            "index for run {} published to log of run {run_id}",
            index.run_id
        )));
    }
    let expected = current_len + appended as u64;
    if index.storage_ref.byte_size != expected {
        return Err(StorageError::BackendError(format!(
            "index for run {run_id} covers {} bytes but log would hold {expected}",
            index.storage_ref.byte_size
        )));
    }
    Ok(())
}

/// A finalized index may only be republished unchanged.
pub(crate) fn check_publish(
    current: &TelemetryIndex,
    next: &TelemetryIndex,
) -> Result<(), StorageError> {
    if current.finalized && current != next {
        return Err(StorageError::Finalized {
            run_id: current.run_id,
            reason: "a finalized index cannot be replaced".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn check_range(
    run_id: RunId,
    start: u64,
    end: u64,
    len: u64,
) -> Result<(), StorageError> {
    if start > end || end > len {
        return Err(StorageError::BackendError(format!(
            "read range [{start}, {end}) out of bounds for run {run_id} (log length {len})"
        )));
    }
    Ok(())
}

impl TelemetryLogStore for InMemoryTelemetryStore {
    fn create(&self, run_id: RunId) -> Result<String, StorageError> {
        let mut logs = self.logs.write().map_err(|_| lock_err("telemetry.create"))?;
        if logs.contains_key(&run_id) {
            return Err(StorageError::DuplicateKey(format!("telemetry:{run_id}")));
        }
        let location = format!("memory://telemetry/{run_id}");
        logs.insert(
            run_id,
            MemoryLog {
                bytes: Vec::new(),
                index: TelemetryIndex::new(run_id, location.clone()),
            },
        );
        Ok(location)
    }

    fn append(&self, run_id: RunId, bytes: &[u8], index: TelemetryIndex) -> Result<(), StorageError> {
        let mut logs = self.logs.write().map_err(|_| lock_err("telemetry.append"))?;
        let log = logs
            .get_mut(&run_id)
            .ok_or(StorageError::TelemetryNotFound(run_id))?;
        if log.index.finalized {
            return Err(StorageError::Finalized {
                run_id,
                reason: "append rejected".to_string(),
            });
        }
        check_append(run_id, log.bytes.len() as u64, bytes.len(), &index)?;
        log.bytes.extend_from_slice(bytes);
        log.index = index;
        Ok(())
    }

    fn publish_index(&self, index: TelemetryIndex) -> Result<(), StorageError> {
        let mut logs = self.logs.write().map_err(|_| lock_err("telemetry.publish_index"))?;
        let run_id = index.run_id;
        let log = logs
            .get_mut(&run_id)
            .ok_or(StorageError::TelemetryNotFound(run_id))?;
        check_append(run_id, log.bytes.len() as u64, 0, &index)?;
        check_publish(&log.index, &index)?;
        log.index = index;
        Ok(())
    }

    fn index(&self, run_id: RunId) -> Result<Option<TelemetryIndex>, StorageError> {
        let logs = self.logs.read().map_err(|_| lock_err("telemetry.index"))?;
        Ok(logs.get(&run_id).map(|log| log.index.clone()))
    }

    fn read_range(&self, run_id: RunId, start: u64, end: u64) -> Result<Vec<u8>, StorageError> {
        let logs = self.logs.read().map_err(|_| lock_err("telemetry.read_range"))?;
        let log = logs
            .get(&run_id)
            .ok_or(StorageError::TelemetryNotFound(run_id))?;
        check_range(run_id, start, end, log.bytes.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(log.bytes[start as usize..end as usize].to_vec())
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStores {
    /// Node store.
    pub nodes: Arc<InMemoryNodeStore>,
    /// Run store.
    pub runs: Arc<InMemoryRunStore>,
    /// Telemetry logs.
    pub telemetry: Arc<InMemoryTelemetryStore>,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
