use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use crate::store::RunLock;

/// Errors from the file-backed run lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("opening lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("flock on {path}: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("run lock {lock_id} is not held by this process")]
    NotHeld { lock_id: u64 },
}

/// Run lock backed by `flock(2)` on a file per lock id.
///
/// The lock is advisory and shared by every process that uses the same
/// directory. Acquisition never blocks. The kernel drops the lock if the
/// process dies, so a crashed run cannot lock out later ones.
#[derive(Debug)]
pub struct FileRunLock {
    dir: PathBuf,
    held: parking_lot::Mutex<HashMap<u64, File>>,
}

impl FileRunLock {
    /// Creates a lock rooted at `dir`. The directory must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lock file path for `lock_id`.
    pub fn path_for(&self, lock_id: u64) -> PathBuf {
        self.dir.join(format!("metrics-rollup-{lock_id}.lock"))
    }

    /// Returns true if this handle currently holds `lock_id`.
    pub fn is_held(&self, lock_id: u64) -> bool {
        self.held.lock().contains_key(&lock_id)
    }
}

impl RunLock for FileRunLock {
    async fn try_acquire(&self, lock_id: u64) -> Result<bool> {
        // Not re-entrant: a second acquire through the same handle is denied.
        if self.is_held(lock_id) {
            return Ok(false);
        }

        let path = self.path_for(lock_id);
        let Some(file) = try_lock_exclusive(&path)? else {
            debug!(path = %path.display(), "run lock busy");
            return Ok(false);
        };

        let mut held = self.held.lock();
        if held.contains_key(&lock_id) {
            // Lost a race with a concurrent acquire on this same handle.
            return Ok(false);
        }
        held.insert(lock_id, file);

        debug!(path = %path.display(), "run lock acquired");
        Ok(true)
    }

    async fn release(&self, lock_id: u64) -> Result<()> {
        let file = self
            .held
            .lock()
            .remove(&lock_id)
            .ok_or(LockError::NotHeld { lock_id })?;

        let path = self.path_for(lock_id);

        // SAFETY: the descriptor is owned by `file`, which is alive here.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(LockError::Flock {
                path,
                source: io::Error::last_os_error(),
            }
            .into());
        }

        drop(file);
        debug!(path = %path.display(), "run lock released");
        Ok(())
    }
}

/// Opens `path` and takes a non-blocking exclusive flock on it.
///
/// Returns `Ok(None)` when someone else holds the lock.
fn try_lock_exclusive(path: &Path) -> Result<Option<File>, LockError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    // SAFETY: the descriptor is owned by `file`, which outlives this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(None),
        _ => Err(LockError::Flock {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}
