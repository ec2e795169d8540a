//! Single-owner lock on a persistent data directory.
//!
//! The owner takes an advisory exclusive lock (`flock` on Unix, `LockFileEx`
//! on Windows) on `<dir>/universe.lock` and records itself in that file, so a
//! second process that is turned away can say who holds the directory. The
//! OS lock goes away with the process; the owner record is left behind and is
//! overwritten by the next owner.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ResourceKind, UniverseError, UniverseResult};

/// File name of the lock inside a data directory.
pub const LOCK_FILE: &str = "universe.lock";

/// Who holds a data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// Crate version of the holder.
    pub version: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Exclusive ownership of a data directory, held until dropped.
#[derive(Debug)]
pub struct DataDirLock {
    _file: File,
    path: PathBuf,
    owner: LockOwner,
}

impl DataDirLock {
    /// Takes the lock on `dir` and records this process as its owner.
    ///
    /// # Errors
    ///
    /// - `Conflict` if another process holds the directory; the reason names
    ///   the recorded owner when it can be read
    /// - `Storage` if the lock file cannot be opened or written
    pub fn acquire(dir: &Path) -> UniverseResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_io("failed to open", &path, &e))?;

        let taken = try_lock_exclusive(&file).map_err(|e| lock_io("failed to lock", &path, &e))?;
        if !taken {
            let holder = read_owner(&mut file).map_or_else(
                || "held by another process".to_string(),
                |o| format!("held by pid {} since {}", o.pid, o.acquired_at.to_rfc3339()),
            );
            tracing::warn!(dir = %dir.display(), %holder, "data directory is locked");
            return Err(UniverseError::Conflict {
                resource: ResourceKind::DataDir,
                id: dir.display().to_string(),
                reason: holder,
            });
        }

        let owner = LockOwner::current();
        write_owner(&mut file, &owner).map_err(|e| lock_io("failed to record owner in", &path, &e))?;
        tracing::debug!(dir = %dir.display(), pid = owner.pid, "data directory locked");
        Ok(Self {
            _file: file,
            path,
            owner,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The owner record this process wrote.
    #[must_use]
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

fn lock_io(action: &str, path: &Path, e: &std::io::Error) -> UniverseError {
    UniverseError::Storage {
        message: format!("{action} lock file {}: {e}", path.display()),
    }
}

fn read_owner(file: &mut File) -> Option<LockOwner> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    serde_json::from_str(text.trim()).ok()
}

fn write_owner(file: &mut File, owner: &LockOwner) -> std::io::Result<()> {
    let text = serde_json::to_string(owner).map_err(std::io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(text.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()
}

/// Returns `Ok(false)` when another holder has the lock.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle belongs to `file`; OVERLAPPED is zeroable plain data.
    let ok = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if ok != 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(any(unix, windows)))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "data directory locking is not supported on this platform",
    ))
}
