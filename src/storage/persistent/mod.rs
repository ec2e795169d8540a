//! Persistent storage backend.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for node and run records
//! - One append-only log file per run for telemetry
//! - A data directory lock that records its owning process
//! - CRC32 checksums for corruption detection
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PersistentStores                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────────────┐           │
//! │  │ WriteAheadLog   │  │ PersistentTelemetryStore │           │
//! │  │ nodes + runs    │  │ telemetry/<run>.log|.idx │           │
//! │  └────────┬────────┘  └────────────┬─────────────┘           │
//! │           └──────────┬─────────────┘                         │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │ DataDirLock (flock) │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod dir_lock;
mod logs;
mod stores;
mod wal;

pub use dir_lock::{DataDirLock, LockOwner, LOCK_FILE};
pub use logs::PersistentTelemetryStore;
pub use stores::{
    PersistentNodeStore, PersistentRunStore, PersistentStores, RecoveryReport, INTERRUPTED_REASON,
};
pub use wal::{WalEntry, WalEntryKind, WalIterator, WriteAheadLog};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::UniverseResult;

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

/// Open or create a persistent data directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If WAL replay fails due to corruption
///
/// # Example
/// ```rust,ignore
/// use universe_core::storage::persistent::{open_database, PersistentConfig};
///
/// let (stores, report) = open_database("./universe.data", None)?;
/// println!("{} runs interrupted", report.interrupted_runs.len());
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> UniverseResult<(PersistentStores, RecoveryReport)> {
    PersistentStores::open(path.as_ref(), config.unwrap_or_default())
}
