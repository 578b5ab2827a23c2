//! Single-session guard
//!
//! All resource names are fixed, so two sessions on one host would clobber
//! each other. An exclusive `flock` on a file in the state directory is held
//! for the life of the session; the kernel drops it if the process dies.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SessionError;

const LOCK_FILE: &str = "xivomega.lock";

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Take the lock or fail immediately if another session holds it
    pub fn acquire(state_dir: &Path) -> Result<Self, SessionError> {
        std::fs::create_dir_all(state_dir).map_err(|e| {
            SessionError::Config(format!(
                "cannot create state directory {}: {e}",
                state_dir.display()
            ))
        })?;

        let path = state_dir.join(LOCK_FILE);
        // Never truncate before holding the lock
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                SessionError::Config(format!("cannot open lock file {}: {e}", path.display()))
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => {
                    Err(SessionError::AlreadyRunning(path.display().to_string()))
                }
                _ => Err(SessionError::Config(format!(
                    "cannot lock {}: {err}",
                    path.display()
                ))),
            };
        }

        // Owner pid is informational only
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        debug!(path = %path.display(), "Session lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
