//! PID lock file: at most one controller per WAN per host.
//!
//! The lock is a plain text file holding the owner's PID. Acquisition
//! validates liveness with `kill(pid, 0)`, so a lock left behind by a killed
//! process is reclaimed instead of wedging the controller until someone
//! cleans up by hand.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by running pid {pid}")]
    Busy { path: PathBuf, pid: i32 },
    #[error("lock file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    held: bool,
}

impl PidLock {
    /// Acquire the lock for the current process, reclaiming stale locks.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();

        if let Ok(raw) = fs::read_to_string(&path) {
            match raw.trim().parse::<i32>() {
                Ok(pid) if pid_alive(pid) => {
                    return Err(LockError::Busy { path, pid });
                }
                Ok(pid) => {
                    tracing::warn!(path = %path.display(), pid, "reclaiming stale lock from dead process");
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "reclaiming unparseable lock file");
                }
            }
            fs::remove_file(&path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(PidLock { path, held: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. Idempotent.
    pub fn release(&mut self) -> std::io::Result<()> {
        if self.held {
            self.held = false;
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// Whether `pid` names a live process (EPERM still means alive).
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
