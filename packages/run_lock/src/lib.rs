#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Single-instance guard backed by a PID file.
//!
//! [`RunLock::acquire`] creates the lock file exclusively and writes the
//! current process id into it. A lock file left behind by a process that
//! is no longer running is treated as stale and replaced. The lock is
//! released explicitly with [`RunLock::release`] or when the guard is
//! dropped.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

/// File name used for the default lock location.
pub const DEFAULT_LOCK_FILE_NAME: &str = "chunkpush.pid";

/// Errors acquiring or releasing the lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("Another instance (pid {pid}) is already running; lock file {}", path.display())]
    Conflict {
        /// Lock file path.
        path: PathBuf,
        /// Process id recorded in the lock file.
        pid: u32,
    },

    /// I/O error touching the lock file.
    #[error("Lock file {}: {source}", path.display())]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Default lock file location: `<temp dir>/chunkpush.pid`.
#[must_use]
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_LOCK_FILE_NAME)
}

/// A held single-instance lock.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl RunLock {
    /// Takes the lock at `path` for the current process.
    ///
    /// # Errors
    ///
    /// * [`LockError::Conflict`] if a running process already holds it
    /// * [`LockError::Io`] if the lock file cannot be created, read, or
    ///   replaced
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let pid = std::process::id();

        match try_create(&path, pid) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_pid(&path)?;
                if let Some(holder) = holder
                    && is_process_alive(holder)
                {
                    return Err(LockError::Conflict { path, pid: holder });
                }

                match holder {
                    Some(holder) => {
                        log::warn!(
                            "Removing stale lock {} left by pid {holder}",
                            path.display()
                        );
                    }
                    None => log::warn!("Removing unreadable lock {}", path.display()),
                }
                remove(&path)?;

                // A second contender may have won the race in between.
                try_create(&path, pid).map_err(|source| {
                    if source.kind() == ErrorKind::AlreadyExists {
                        match read_pid(&path) {
                            Ok(Some(pid)) => LockError::Conflict {
                                path: path.clone(),
                                pid,
                            },
                            Ok(None) => LockError::Io {
                                path: path.clone(),
                                source,
                            },
                            Err(e) => e,
                        }
                    } else {
                        LockError::Io {
                            path: path.clone(),
                            source,
                        }
                    }
                })?;
            }
            Err(source) => return Err(LockError::Io { path, source }),
        }

        log::debug!("Acquired lock {} (pid {pid})", path.display());
        Ok(Self {
            path,
            pid,
            released: false,
        })
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file if it still belongs to this process.
    ///
    /// # Errors
    ///
    /// * [`LockError::Io`] if the lock file cannot be read or removed
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if read_pid(&self.path)? == Some(self.pid) {
            remove(&self.path)?;
            log::debug!("Released lock {}", self.path.display());
        } else {
            log::warn!(
                "Lock {} no longer belongs to pid {}; leaving it",
                self.path.display(),
                self.pid
            );
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::warn!("Failed to release lock: {e}");
        }
    }
}

fn try_create(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

/// Reads the pid recorded in `path`. `None` when the file is missing or
/// holds something that is not a pid.
fn read_pid(path: &Path) -> Result<Option<u32>, LockError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Whether a process with `pid` is currently running.
#[cfg(target_os = "linux")]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Whether a process with `pid` is currently running.
#[cfg(all(unix, not(target_os = "linux")))]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Whether a process with `pid` is currently running.
///
/// Without a cheap liveness probe every recorded pid counts as alive, so
/// stale locks have to be removed by hand.
#[cfg(not(unix))]
#[must_use]
pub const fn is_process_alive(_pid: u32) -> bool {
    true
}
