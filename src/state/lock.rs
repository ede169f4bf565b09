//! Advisory lock on the state file's sibling `.lock` file.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long to sleep between attempts while waiting for the lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file path for a state file: the same path with `.lock` appended.
pub fn lock_path(state_path: &Path) -> PathBuf {
    let mut name = OsString::from(state_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Held exclusive lock. Dropping it unlocks and closes the file.
#[derive(Debug)]
pub struct StateLockGuard {
    file: File,
    path: PathBuf,
}

impl StateLockGuard {
    /// Take the lock without waiting.
    ///
    /// # Errors
    /// Returns `StateLock` if the lock file cannot be opened or another
    /// holder has it.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::StateLock(format!("cannot create {}: {}", dir.display(), e))
                })?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::StateLock(format!("cannot open {}: {}", path.display(), e)))?;
        FileExt::try_lock_exclusive(&file).map_err(|e| {
            Error::StateLock(format!("{} is locked: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "state lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Retry `try_acquire` until it succeeds or `timeout` elapses.
    ///
    /// Blocks the calling thread between attempts.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            match Self::try_acquire(path) {
                Ok(guard) => return Ok(guard),
                Err(err) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(Error::StateLock(format!(
                            "gave up after {:?}: {}",
                            timeout, err
                        )));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL.min(timeout - elapsed));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        } else {
            debug!(path = %self.path.display(), "state lock released");
        }
    }
}
