//! Single-writer exclusion on the output directory.
//!
//! Two builds sharing an output root would corrupt each other's state, so
//! the driver holds an exclusive advisory lock on `<out>/.lock` for its whole
//! run. Contention is retried on a caller-supplied schedule.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

/// Name of the sentinel file inside the locked directory.
pub const LOCK_FILE_NAME: &str = ".lock";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to prepare lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "timed out waiting to lock {path}; is another build running in this output directory?"
    )]
    Contended { path: PathBuf },
}

/// Schedules retries while the lock is contended.
pub trait Waiter {
    /// Waits for the next attempt. Returns false once the budget is spent.
    fn wait(&mut self) -> bool;

    /// Budget left before the waiter gives up.
    fn remaining(&self) -> Duration;
}

/// Sleeps `interval` between attempts until `timeout` has elapsed.
#[derive(Debug, Clone)]
pub struct DeadlineWaiter {
    interval: Duration,
    deadline: Instant,
}

impl DeadlineWaiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Default for DeadlineWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_LOCK_TIMEOUT)
    }
}

impl Waiter for DeadlineWaiter {
    fn wait(&mut self) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        std::thread::sleep(self.interval.min(remaining));
        true
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Held exclusive lock. Dropping it closes the file and releases the lock.
#[derive(Debug)]
pub struct ProcessLock {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    /// Locks `dir`, creating it if needed.
    pub fn acquire(dir: &Path, waiter: &mut dyn Waiter) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        let mut waited = false;
        loop {
            if file.try_lock_exclusive().is_ok() {
                if waited {
                    tracing::info!("lock on {} acquired after waiting", path.display());
                }
                return Ok(Self {
                    file: Some(file),
                    path,
                });
            }

            tracing::warn!(
                "waiting up to {:.1}s to lock {}...",
                waiter.remaining().as_secs_f64(),
                path.display()
            );
            waited = true;
            if !waiter.wait() {
                return Err(LockError::Contended { path });
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock. Calling it twice is harmless.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}
