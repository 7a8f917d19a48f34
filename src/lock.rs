//! Server-wide lock serializing compile, launch, and kill sequences.
//!
//! Backed by `flock(2)` on a file in the work directory. Every acquisition
//! opens its own descriptor, so the lock excludes tasks within one process
//! as well as separate processes. Dropping the guard closes the descriptor,
//! which releases the lock on every exit path.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::paths::{ensure_directory_for, Owner};

/// Pause between non-blocking lock attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to the lock file. Cheap to clone; holds no descriptor itself.
#[derive(Debug, Clone)]
pub struct GlobalLock {
    path: PathBuf,
}

impl GlobalLock {
    /// Create the lock file (and its directory) if needed.
    ///
    /// Run once at startup, before any worker processes exist.
    pub fn create(path: &Path, owner: Owner) -> Result<Self> {
        ensure_directory_for(path, false, owner)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create global lock {}", path.display()))?;
        std::os::unix::fs::chown(path, owner.uid, owner.gid)
            .with_context(|| format!("Failed to change ownership of {}", path.display()))?;

        debug!(lock = %path.display(), "Created global lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Attach to a lock file that [`GlobalLock::create`] already made.
    pub fn reconnect(path: &Path) -> Result<Self> {
        open_lock_file(path)
            .with_context(|| format!("Failed to reconnect to global lock {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting at most `timeout`.
    ///
    /// `None` blocks until the lock is free.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        let file = open_lock_file(&self.path)
            .with_context(|| format!("Failed to open global lock {}", self.path.display()))?;

        let Some(timeout) = timeout else {
            return self.acquire_blocking(file).await;
        };

        let start = Instant::now();
        loop {
            if try_flock_exclusive(&file)
                .with_context(|| format!("Failed to acquire global lock {}", self.path.display()))?
            {
                debug!(lock = %self.path.display(), "Acquired global lock");
                return Ok(LockGuard {
                    file: Some(file),
                    path: self.path.clone(),
                });
            }

            if start.elapsed() >= timeout {
                bail!(
                    "Timed out after {timeout:?} waiting for global lock {}",
                    self.path.display()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn acquire_blocking(&self, file: File) -> Result<LockGuard> {
        let file = tokio::task::spawn_blocking(move || {
            flock(&file, libc::LOCK_EX).map(|()| file)
        })
        .await
        .context("Lock task panicked")?
        .with_context(|| format!("Failed to acquire global lock {}", self.path.display()))?;

        debug!(lock = %self.path.display(), "Acquired global lock");
        Ok(LockGuard {
            file: Some(file),
            path: self.path.clone(),
        })
    }
}

/// Held lock. Released by [`LockGuard::release`] or on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    /// Release the lock, reporting failure.
    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            flock(&file, libc::LOCK_UN).with_context(|| {
                format!("Failed to release global lock {}", self.path.display())
            })?;
            debug!(lock = %self.path.display(), "Released global lock");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = flock(&file, libc::LOCK_UN) {
                // Closing the descriptor below releases it regardless.
                warn!(lock = %self.path.display(), error = %e, "Failed to unlock global lock");
            }
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: flock is a standard POSIX call. The fd is valid for the
    // lifetime of `file`, which outlives the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Try to take the lock without blocking.
///
/// Returns `Ok(false)` if someone else holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}
