//! One file's trip through the pipeline.
//!
//! ```text
//! Pending -> Reading -> Extracting -> Diffing -> Syncing -> AuditWriting -> Done(Success)
//!                            |            |
//!                            |            +-> Done(Success)             (no changes, or dry run)
//!                            +-> Done(SkippedUnresolved)                (nothing resolved)
//! any non-terminal state -> Retrying -> Reading                        (retryable error, budget left)
//! any non-terminal state -> Done(Failed)
//! ```
//!
//! Cancellation is observed at every suspension point up to `Syncing`. Once
//! the change set is handed to the store the commit runs to completion
//! (bounded by the request timeout); the store never sees a partial set.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slotsync_core::{
    ChangeCounts, ClassifiedError, CoverageWindow, ErrorCode, ErrorDomain, FileTaskState,
    PartitionKey, TaskOutcome, TaskStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditWriter, FileAudit};
use crate::diff::diff_within;
use crate::discovery::SourceFile;
use crate::extract::{Extraction, Extractor};
use crate::reader::LockAwareReader;
use crate::retry::{backoff_sleep, RetryPolicy};
use crate::store::RemoteStore;

// ---------------------------------------------------------------------------
// Per-partition locks
// ---------------------------------------------------------------------------

/// Serializes snapshot + apply per partition, so a change set is always
/// computed against a snapshot no other task can invalidate before commit.
#[derive(Debug, Clone, Default)]
pub struct PartitionLocks {
    inner: Arc<Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>>,
}

impl PartitionLocks {
    /// Lock every partition in `partitions`. Callers pass them ascending so
    /// overlapping acquisitions cannot deadlock.
    pub async fn acquire(
        &self,
        partitions: impl IntoIterator<Item = PartitionKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::new();
        for partition in partitions {
            let lock = {
                let mut map = self.inner.lock().await;
                map.entry(partition).or_default().clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

// ---------------------------------------------------------------------------
// Shared task context
// ---------------------------------------------------------------------------

/// Everything a file-task borrows from the cycle. Shared via `Arc`.
pub struct TaskContext {
    pub reader: LockAwareReader,
    pub extractor: Extractor,
    pub store: Arc<dyn RemoteStore>,
    pub audit: Arc<dyn AuditWriter>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub locks: PartitionLocks,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// FileTask
// ---------------------------------------------------------------------------

/// Drives one [`SourceFile`] to a terminal [`TaskStatus`].
#[derive(Debug)]
pub struct FileTask {
    file: SourceFile,
    cycle_id: String,
    state: FileTaskState,
    attempts: u32,
}

/// What a successful attempt produced.
struct Completed {
    status: TaskStatus,
    extraction: Extraction,
    changes: ChangeCounts,
}

impl FileTask {
    pub fn new(file: SourceFile, cycle_id: impl Into<String>) -> Self {
        Self {
            file,
            cycle_id: cycle_id.into(),
            state: FileTaskState::Pending,
            attempts: 0,
        }
    }

    pub fn state(&self) -> FileTaskState {
        self.state
    }

    /// Run to completion. Never panics on task errors; every failure is
    /// folded into a `Failed` outcome.
    pub async fn run(mut self, ctx: Arc<TaskContext>, cancel: CancellationToken) -> TaskOutcome {
        loop {
            self.attempts += 1;
            self.transition(FileTaskState::Reading);
            let err = match self.attempt(&ctx, &cancel).await {
                Ok(done) => return self.finish(done),
                Err(err) => err,
            };

            if err.is_cancelled() || cancel.is_cancelled() {
                return self.fail(cancelled_as(err));
            }
            if !err.retryable || !ctx.retry.allows_retry_after(self.attempts) {
                return self.fail(err);
            }

            self.transition(FileTaskState::Retrying);
            let delay = ctx.retry.backoff(self.attempts);
            tracing::warn!(
                file = %self.file.path.display(),
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );
            if !backoff_sleep(delay, &cancel).await {
                return self.fail(ClassifiedError::cancelled(err.domain, "retry backoff"));
            }
        }
    }

    async fn attempt(
        &mut self,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<Completed, ClassifiedError> {
        let handle = ctx.reader.open(&self.file.path, cancel).await?;

        self.transition(FileTaskState::Extracting);
        let extractor = ctx.extractor.clone();
        let partition_name = self.file.partition_name.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extractor.extract(handle, Some(partition_name.as_str()))
        })
        .await
        .map_err(|e| {
            ClassifiedError::source_read(ErrorCode::Io, format!("extract worker failed: {e}"))
        })??;

        if extraction.is_empty() {
            tracing::info!(
                file = %self.file.path.display(),
                excluded = extraction.excluded,
                "no resolved records, nothing to sync"
            );
            return Ok(Completed {
                status: TaskStatus::SkippedUnresolved,
                extraction,
                changes: ChangeCounts::default(),
            });
        }
        if cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled(ErrorDomain::SourceRead, "extraction"));
        }

        self.transition(FileTaskState::Diffing);
        let window = CoverageWindow::from_records(&extraction.records);
        let _guards = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ClassifiedError::cancelled(ErrorDomain::RemoteSync, "partition lock"));
            }
            guards = ctx.locks.acquire(window.partitions()) => guards,
        };

        let mut snapshot = Vec::new();
        for (partition, range) in window.ranges() {
            let records = store_call(
                ctx.request_timeout,
                cancel,
                "fetch_snapshot",
                ctx.store.fetch_snapshot(partition, range),
            )
            .await?;
            snapshot.extend(records);
        }
        let changes = diff_within(&extraction.records, &snapshot, &window);
        let counts = changes.counts();

        if changes.is_empty() || ctx.dry_run {
            tracing::debug!(
                file = %self.file.path.display(),
                changes = changes.len(),
                dry_run = ctx.dry_run,
                "nothing to apply"
            );
            return Ok(Completed {
                status: TaskStatus::Success,
                extraction,
                changes: counts,
            });
        }
        // Last point where cancellation leaves the store untouched.
        if cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled(ErrorDomain::RemoteSync, "sync"));
        }

        self.transition(FileTaskState::Syncing);
        match tokio::time::timeout(ctx.request_timeout, ctx.store.apply_changes(&changes)).await {
            Ok(result) => result?,
            Err(_) => return Err(timeout_error("apply_changes", ctx.request_timeout)),
        }
        tracing::info!(
            file = %self.file.path.display(),
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            "change set applied"
        );

        self.transition(FileTaskState::AuditWriting);
        let audit = FileAudit {
            cycle_id: self.cycle_id.clone(),
            file: self.file.path.clone(),
            digest: extraction.digest.clone(),
            changes,
        };
        write_audit(ctx, &audit, cancel).await;

        Ok(Completed {
            status: TaskStatus::Success,
            extraction,
            changes: counts,
        })
    }

    fn transition(&mut self, next: FileTaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        tracing::trace!(
            file = %self.file.path.display(),
            from = %self.state,
            to = %next,
            "task state"
        );
        self.state = next;
    }

    fn finish(mut self, done: Completed) -> TaskOutcome {
        self.transition(FileTaskState::Done(done.status));
        TaskOutcome {
            file: self.file.path,
            partition: Some(self.file.partition),
            status: done.status,
            records: done.extraction.records.len(),
            excluded: done.extraction.excluded,
            changes: done.changes,
            attempts: self.attempts,
            error: None,
        }
    }

    fn fail(mut self, err: ClassifiedError) -> TaskOutcome {
        self.transition(FileTaskState::Done(TaskStatus::Failed));
        if err.is_cancelled() {
            tracing::info!(file = %self.file.path.display(), "task cancelled");
        } else {
            tracing::error!(
                file = %self.file.path.display(),
                attempts = self.attempts,
                error = %err,
                "task failed"
            );
        }
        TaskOutcome::failed(self.file.path, Some(self.file.partition), self.attempts, err)
    }
}

/// Audit after a committed apply. The store already holds the changes, so
/// only the audit write is retried and exhaustion is logged, not returned.
async fn write_audit(ctx: &TaskContext, audit: &FileAudit, cancel: &CancellationToken) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match ctx.audit.append(audit).await {
            Ok(path) => {
                tracing::debug!(
                    audit = %path.display(),
                    changes = audit.changes.len(),
                    "audit written"
                );
                return;
            }
            Err(err) => err,
        };
        if !ctx.retry.allows_retry_after(attempt)
            || !backoff_sleep(ctx.retry.backoff(attempt), cancel).await
        {
            tracing::error!(
                file = %audit.file.display(),
                cycle_id = %audit.cycle_id,
                attempts = attempt,
                error = %err,
                "audit write failed after apply; store holds changes without an audit record"
            );
            return;
        }
    }
}

/// Run a store call under the request timeout, giving up early on
/// cancellation. Only for calls that do not mutate the store.
async fn store_call<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    op: &'static str,
    fut: impl Future<Output = Result<T, ClassifiedError>>,
) -> Result<T, ClassifiedError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ClassifiedError::cancelled(ErrorDomain::RemoteSync, op)),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(timeout_error(op, timeout)),
        },
    }
}

fn timeout_error(op: &str, timeout: Duration) -> ClassifiedError {
    ClassifiedError::remote_sync(
        ErrorCode::Timeout,
        format!("{op} timed out after {}s", timeout.as_secs_f32()),
    )
}

/// Errors seen after the token fired are reported as cancellations so they
/// stay out of the systemic-failure count.
fn cancelled_as(err: ClassifiedError) -> ClassifiedError {
    if err.is_cancelled() {
        err
    } else {
        ClassifiedError::cancelled(err.domain, format!("task ({})", err.message))
    }
}
