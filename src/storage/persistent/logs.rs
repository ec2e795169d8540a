//! Per-run telemetry log files.
//!
//! ```text
//! <dir>/telemetry/<run_id>.log   [MAGIC][VERSION][frame][frame]...
//! <dir>/telemetry/<run_id>.idx   [MAGIC][VERSION][TelemetryIndex frame]
//! ```
//!
//! Offsets handed out through [`TelemetryLogStore`] are logical: they start
//! after the header. The `.idx` sidecar is only written for finalized runs;
//! live indexes are rebuilt from the log on open.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::ids::RunId;
use crate::storage::codec;
use crate::storage::lock_err;
use crate::storage::memory::{check_append, check_publish, check_range};
use crate::storage::traits::{StorageError, TelemetryLogStore};
use crate::telemetry::TelemetryIndex;

fn io_err(context: &str, path: &Path, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context} {}: {e}", path.display()))
}

#[derive(Debug)]
struct FileLog {
    path: PathBuf,
    file: File,
    index: TelemetryIndex,
}

/// Telemetry logs stored as one append-only file per run.
#[derive(Debug)]
pub struct PersistentTelemetryStore {
    dir: PathBuf,
    sync_on_write: bool,
    logs: RwLock<HashMap<RunId, FileLog>>,
}

impl PersistentTelemetryStore {
    /// Opens `dir`, loading every log found in it.
    ///
    /// Finalized logs use their sidecar index. Others are re-indexed from
    /// their bytes, and a torn trailing frame is cut off.
    pub(crate) fn open(dir: &Path, sync_on_write: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create", dir, &e))?;
        let mut logs = HashMap::new();

        let entries = fs::read_dir(dir).map_err(|e| io_err("failed to list", dir, &e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| io_err("failed to list", dir, &e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            else {
                tracing::warn!(path = %path.display(), "skipping unrecognized telemetry file");
                continue;
            };
            let log = Self::load(run_id, path)?;
            logs.insert(run_id, log);
        }

        if !logs.is_empty() {
            tracing::info!(dir = %dir.display(), runs = logs.len(), "telemetry logs loaded");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_on_write,
            logs: RwLock::new(logs),
        })
    }

    fn load(run_id: RunId, path: PathBuf) -> Result<FileLog, StorageError> {
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| io_err("failed to read", &path, &e))?;
        let mut cursor = raw.as_slice();
        codec::read_header(&mut cursor).map_err(|e| StorageError::Corrupted {
            location: path.display().to_string(),
            message: format!("bad telemetry log header: {e}"),
        })?;
        let bytes = cursor;
        let logical_len = bytes.len() as u64;
        let location = path.display().to_string();

        let index = match Self::read_sidecar(&path.with_extension("idx")) {
            Some(index)
                if index.finalized
                    && index.run_id == run_id
                    && index.storage_ref.byte_size == logical_len =>
            {
                index
            }
            _ => {
                let (index, valid_len) = TelemetryIndex::rebuild(run_id, location, bytes);
                if valid_len < logical_len {
                    tracing::warn!(
                        %run_id,
                        valid_len,
                        logical_len,
                        "truncating torn telemetry tail"
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .and_then(|f| f.set_len(codec::HEADER_LEN + valid_len))
                        .map_err(|e| io_err("failed to truncate", &path, &e))?;
                }
                index
            }
        };

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_err("failed to open", &path, &e))?;
        Ok(FileLog { path, file, index })
    }

    fn read_sidecar(path: &Path) -> Option<TelemetryIndex> {
        let file = File::open(path).ok()?;
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader).ok()?;
        match codec::decode(&mut reader) {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable index sidecar");
                None
            }
        }
    }

    fn write_sidecar(&self, log: &FileLog) -> Result<(), StorageError> {
        let path = log.path.with_extension("idx");
        let tmp = log.path.with_extension("idx.tmp");
        let encoded = codec::encode(&log.index).map_err(|e| {
            StorageError::SerializationError(format!("telemetry index {}: {e}", log.index.run_id))
        })?;
        let mut file = File::create(&tmp).map_err(|e| io_err("failed to create", &tmp, &e))?;
        codec::write_header(&mut file)
            .and_then(|()| file.write_all(&encoded))
            .and_then(|()| file.sync_all())
            .map_err(|e| io_err("failed to write", &tmp, &e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err("failed to publish", &path, &e))
    }

    /// Ids of every run that has a log.
    pub fn run_ids(&self) -> Result<Vec<RunId>, StorageError> {
        let logs = self.logs.read().map_err(|_| lock_err("telemetry.run_ids"))?;
        Ok(logs.keys().copied().collect())
    }
}

impl TelemetryLogStore for PersistentTelemetryStore {
    fn create(&self, run_id: RunId) -> Result<String, StorageError> {
        let mut logs = self.logs.write().map_err(|_| lock_err("telemetry.create"))?;
        if logs.contains_key(&run_id) {
            return Err(StorageError::DuplicateKey(format!("telemetry:{run_id}")));
        }
        let path = self.dir.join(format!("{run_id}.log"));
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err("failed to create", &path, &e))?;
        codec::write_header(&mut file).map_err(|e| io_err("failed to write", &path, &e))?;
        if self.sync_on_write {
            file.sync_all().map_err(|e| io_err("failed to sync", &path, &e))?;
        }
        let location = path.display().to_string();
        logs.insert(
            run_id,
            FileLog {
                index: TelemetryIndex::new(run_id, location.clone()),
                path,
                file,
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
        check_append(run_id, log.index.storage_ref.byte_size, bytes.len(), &index)?;
        log.file
            .write_all(bytes)
            .map_err(|e| io_err("failed to append to", &log.path, &e))?;
        if self.sync_on_write {
            log.file
                .sync_data()
                .map_err(|e| io_err("failed to sync", &log.path, &e))?;
        }
        log.index = index;
        Ok(())
    }

    fn publish_index(&self, index: TelemetryIndex) -> Result<(), StorageError> {
        let mut logs = self.logs.write().map_err(|_| lock_err("telemetry.publish_index"))?;
        let run_id = index.run_id;
        let log = logs
            .get_mut(&run_id)
            .ok_or(StorageError::TelemetryNotFound(run_id))?;
        check_append(run_id, log.index.storage_ref.byte_size, 0, &index)?;
        check_publish(&log.index, &index)?;
        log.index = index;
        if log.index.finalized {
            self.write_sidecar(log)?;
        }
        Ok(())
    }

    fn index(&self, run_id: RunId) -> Result<Option<TelemetryIndex>, StorageError> {
        let logs = self.logs.read().map_err(|_| lock_err("telemetry.index"))?;
        Ok(logs.get(&run_id).map(|log| log.index.clone()))
    }

    fn read_range(&self, run_id: RunId, start: u64, end: u64) -> Result<Vec<u8>, StorageError> {
        let path = {
            let logs = self.logs.read().map_err(|_| lock_err("telemetry.read_range"))?;
            let log = logs
                .get(&run_id)
                .ok_or(StorageError::TelemetryNotFound(run_id))?;
            check_range(run_id, start, end, log.index.storage_ref.byte_size)?;
            log.path.clone()
        };
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; (end - start) as usize];
        let mut file = File::open(&path).map_err(|e| io_err("failed to open", &path, &e))?;
        file.seek(SeekFrom::Start(codec::HEADER_LEN + start))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| io_err("failed to read", &path, &e))?;
        Ok(buf)
    }
}
