//! Lock-aware source reader.
//!
//! A sheet is "locked" while another process has it open for editing. Two
//! signals are checked on every poll:
//!
//! 1. an office owner file `~$<name>` beside the sheet;
//! 2. on unix, a non-blocking shared `flock` that cannot be taken.
//!
//! [`LockAwareReader::open`] polls until the sheet is free, the wait budget
//! runs out, or the cancellation token fires. The returned [`SourceHandle`]
//! holds the shared lock until it is dropped.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slotsync_core::{ClassifiedError, ErrorCode, ErrorDomain};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::discovery::owner_file_present;

/// An open, shared-locked source file.
#[derive(Debug)]
pub struct SourceHandle {
    path: PathBuf,
    file: File,
}

impl SourceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. Blocking; call from `spawn_blocking`.
    ///
    /// Consumes the handle so the lock is released as soon as the bytes are
    /// in memory.
    pub fn read_all(mut self) -> Result<Vec<u8>, ClassifiedError> {
        let mut buf = Vec::new();
        self.file
            .read_to_end(&mut buf)
            .map_err(|e| ClassifiedError::from_source_io(&self.path, &e))?;
        Ok(buf)
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Polling reader with a bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct LockAwareReader {
    max_wait: Duration,
    poll_interval: Duration,
}

impl LockAwareReader {
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_wait,
            // A zero interval would spin.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Open `path` once no other process holds it.
    ///
    /// Errors:
    /// - `file_missing` (non-retryable) when the file does not exist;
    /// - `file_locked` (retryable) when still locked after `max_wait`;
    /// - `cancelled` when `cancel` fires while waiting.
    pub async fn open(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SourceHandle, ClassifiedError> {
        let deadline = Instant::now() + self.max_wait;
        let mut polls: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled(ErrorDomain::SourceRead, "lock wait"));
            }
            match check_lock(path).await? {
                Attempt::Opened(handle) => {
                    if polls > 0 {
                        tracing::debug!(file = %path.display(), polls, "source unlocked");
                    }
                    return Ok(handle);
                }
                Attempt::Locked(reason) => {
                    tracing::debug!(file = %path.display(), reason, "source locked, waiting");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClassifiedError::source_read(
                    ErrorCode::FileLocked,
                    format!(
                        "{} still locked after {}ms",
                        path.display(),
                        self.max_wait.as_millis()
                    ),
                )
                .with_retryable(true));
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ClassifiedError::cancelled(ErrorDomain::SourceRead, "lock wait"));
                }
                _ = tokio::time::sleep(nap) => {}
            }
            polls += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Locking primitives
// ---------------------------------------------------------------------------

enum Attempt {
    Opened(SourceHandle),
    Locked(&'static str),
}

/// One lock check on the blocking pool; source shares can be slow mounts.
async fn check_lock(path: &Path) -> Result<Attempt, ClassifiedError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || try_open(&owned))
        .await
        .map_err(|e| {
            ClassifiedError::source_read(ErrorCode::Io, format!("lock check worker failed: {e}"))
        })?
}

fn try_open(path: &Path) -> Result<Attempt, ClassifiedError> {
    if owner_file_present(path) {
        return Ok(Attempt::Locked("owner file present"));
    }
    let file = File::open(path).map_err(|e| ClassifiedError::from_source_io(path, &e))?;
    match try_flock_shared(&file) {
        Ok(true) => Ok(Attempt::Opened(SourceHandle {
            path: path.to_path_buf(),
            file,
        })),
        Ok(false) => Ok(Attempt::Locked("exclusive lock held")),
        Err(e) => Err(ClassifiedError::from_source_io(path, &e)),
    }
}

/// `Ok(false)` when another process holds an exclusive lock.
#[cfg(unix)]
fn try_flock_shared(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_flock_shared(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above; closing the fd would release the lock anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
