//! Write-Ahead Log (WAL) for node and run records.
//!
//! Every node and run mutation is appended here before it is applied to the
//! in-memory state, and the whole log is replayed on open.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```
//!
//! A torn final entry (crash mid-write) is cut off on open so later appends
//! start on a frame boundary.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::run::Run;
use crate::storage::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A root node was created.
    NodeInsert(Node),
    /// A child was inserted and its parent's `child_count` bumped, atomically.
    NodeChildForked {
        /// The new node.
        child: Node,
        /// The parent as stored after the fork.
        parent: Node,
    },
    /// A run was enqueued.
    RunInsert(Run),
    /// A run was replaced after a successful version check.
    RunUpdate(Run),
}

struct Writer {
    out: BufWriter<File>,
    sequence: u64,
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// If the file exists, finds the last valid sequence number and drops any
    /// torn tail. Otherwise creates it with the header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if exists && file.metadata()?.len() >= codec::HEADER_LEN {
            let (last_seq, valid_len) = Self::scan(path)?;
            if valid_len < file.metadata()?.len() {
                tracing::warn!(
                    path = %path.display(),
                    last_seq,
                    valid_len,
                    "WAL has a torn tail; truncating to the last whole entry"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last_seq
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };
        drop(file);

        // Reopen for appending
        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Writer {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the sequence number assigned to this entry.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;

        let candidate = writer.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };

        let encoded = codec::encode(&entry)?;

        writer.out.write_all(&encoded)?;
        writer.out.flush()?;

        if self.sync_on_write {
            writer.out.get_ref().sync_all()?;
        }

        writer.sequence = candidate;

        Ok(candidate)
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay mutations.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Last valid sequence number and the file length it ends at.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut last_seq = 0;
        let mut iter = WalIterator::new(path)?;
        let mut valid_len = iter.position()?;

        while let Some(entry_result) = iter.next() {
            match entry_result {
                Ok(entry) => {
                    last_seq = entry.sequence;
                    valid_len = iter.position()?;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        sequence = last_seq + 1,
                        error = %e,
                        "WAL corruption detected; replay stops here"
                    );
                    break;
                }
            }
        }

        Ok((last_seq, valid_len))
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Skip header
        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn at_eof(&mut self) -> IoResult<bool> {
        Ok(self.position()? >= self.file_size)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.at_eof() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }

        Some(codec::decode(&mut self.reader))
    }
}
