//! Bounded fan-out of file-tasks with systemic-failure escalation.
//!
//! At most `max_concurrency` tasks run at once; a new file is only started
//! when a slot frees up. When more than `failure_threshold` files have
//! failed (cancellations excluded) the cycle's child token is cancelled, no
//! further files start, and [`CycleError::Systemic`] is returned with the
//! partial summary.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use slotsync_core::{
    ClassifiedError, CycleSummary, ErrorCode, ErrorDomain, PartitionKey, TaskOutcome, TaskStatus,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::discovery::SourceFile;
use crate::error::CycleError;
use crate::task::{FileTask, TaskContext};

/// Concurrency and escalation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorLimits {
    pub max_concurrency: usize,
    /// Systemic once failed files exceed this count.
    pub failure_threshold: usize,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            failure_threshold: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// CycleProgress
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProgressState {
    /// Outcomes so far; `None` while idle.
    summary: Option<CycleSummary>,
    in_flight: BTreeMap<PathBuf, PartitionKey>,
}

/// Live view of the running cycle, readable from outside the cycle's future.
#[derive(Debug, Clone, Default)]
pub struct CycleProgress {
    state: Arc<Mutex<ProgressState>>,
}

impl CycleProgress {
    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, summary: &CycleSummary) {
        let mut state = self.lock();
        state.summary = Some(summary.clone());
        state.in_flight.clear();
    }

    fn started(&self, file: &SourceFile) {
        self.lock().in_flight.insert(file.path.clone(), file.partition);
    }

    fn finished(&self, outcome: &TaskOutcome) {
        let mut state = self.lock();
        state.in_flight.remove(&outcome.file);
        if let Some(summary) = state.summary.as_mut() {
            summary.record(outcome.clone());
        }
    }

    fn end(&self) {
        let mut state = self.lock();
        state.summary = None;
        state.in_flight.clear();
    }

    pub fn is_running(&self) -> bool {
        self.lock().summary.is_some()
    }

    /// Files started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Take the running cycle's summary, with every in-flight file recorded
    /// as a cancelled failure. `None` when no cycle is running.
    pub fn abandon(&self) -> Option<CycleSummary> {
        let mut state = self.lock();
        let mut summary = state.summary.take()?;
        for (file, partition) in std::mem::take(&mut state.in_flight) {
            summary.record(TaskOutcome::failed(
                file,
                Some(partition),
                1,
                ClassifiedError::new(
                    ErrorDomain::RemoteSync,
                    ErrorCode::Cancelled,
                    "task abandoned at shutdown deadline",
                ),
            ));
        }
        summary.finish(Utc::now());
        Some(summary)
    }
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator {
    ctx: Arc<TaskContext>,
    limits: OrchestratorLimits,
    progress: CycleProgress,
}

impl TaskOrchestrator {
    pub fn new(ctx: TaskContext, limits: OrchestratorLimits) -> Self {
        Self {
            ctx: Arc::new(ctx),
            limits: OrchestratorLimits {
                max_concurrency: limits.max_concurrency.max(1),
                ..limits
            },
            progress: CycleProgress::default(),
        }
    }

    pub fn progress(&self) -> &CycleProgress {
        &self.progress
    }

    pub fn limits(&self) -> OrchestratorLimits {
        self.limits
    }

    pub fn dry_run(&self) -> bool {
        self.ctx.dry_run
    }

    /// Run one cycle over `files`.
    ///
    /// `cancel` is the caller's token; the cycle works on a child of it so
    /// escalation can stop this cycle without touching the caller's token.
    pub async fn run_cycle(
        &self,
        cycle_id: &str,
        files: Vec<SourceFile>,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, CycleError> {
        let cycle_token = cancel.child_token();
        let mut summary = CycleSummary::new(cycle_id, Utc::now(), self.ctx.dry_run);
        let mut pending = files.into_iter();
        let mut running: JoinSet<TaskOutcome> = JoinSet::new();
        let mut counted_failures = 0usize;
        let mut systemic = false;
        self.progress.begin(&summary);

        tracing::info!(
            cycle_id,
            files = pending.len(),
            max_concurrency = self.limits.max_concurrency,
            dry_run = self.ctx.dry_run,
            "cycle started"
        );

        loop {
            while !cycle_token.is_cancelled() && running.len() < self.limits.max_concurrency {
                let Some(file) = pending.next() else { break };
                self.spawn(&mut running, file, cycle_id, &cycle_token);
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                // Tasks catch their own panics; a JoinError here means the set
                // was aborted from outside.
                Err(err) => {
                    tracing::error!(cycle_id, error = %err, "file-task join failed");
                    continue;
                }
            };

            let counts_toward_threshold = outcome.status == TaskStatus::Failed
                && !outcome.error.as_ref().is_some_and(ClassifiedError::is_cancelled);
            self.progress.finished(&outcome);
            summary.record(outcome);

            if counts_toward_threshold {
                counted_failures += 1;
                if !systemic && counted_failures > self.limits.failure_threshold {
                    systemic = true;
                    tracing::error!(
                        cycle_id,
                        failed = counted_failures,
                        threshold = self.limits.failure_threshold,
                        "systemic failure threshold crossed, cancelling cycle"
                    );
                    cycle_token.cancel();
                }
            }
        }

        self.progress.end();
        let unstarted = pending.len();
        summary.fatal = systemic;
        summary.finish(Utc::now());
        tracing::info!(
            cycle_id,
            succeeded = summary.succeeded,
            skipped = summary.skipped_unresolved,
            failed = summary.failed,
            unstarted,
            changes_applied = summary.changes_applied,
            "cycle finished"
        );

        if systemic {
            return Err(CycleError::Systemic {
                failed: counted_failures,
                threshold: self.limits.failure_threshold,
                summary: Box::new(summary),
            });
        }
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled {
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }

    fn spawn(
        &self,
        running: &mut JoinSet<TaskOutcome>,
        file: SourceFile,
        cycle_id: &str,
        token: &CancellationToken,
    ) {
        self.progress.started(&file);
        let ctx = Arc::clone(&self.ctx);
        let token = token.clone();
        let path = file.path.clone();
        let partition = Some(file.partition);
        let task = FileTask::new(file, cycle_id);
        running.spawn(async move {
            match AssertUnwindSafe(task.run(ctx, token)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => TaskOutcome::failed(
                    path,
                    partition,
                    1,
                    ClassifiedError::source_read(ErrorCode::Io, "file-task panicked"),
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, partition: u32) -> SourceFile {
        SourceFile {
            path: PathBuf::from(name),
            partition_name: name.to_string(),
            partition: PartitionKey(partition),
        }
    }

    #[test]
    fn abandon_marks_in_flight_files_failed() {
        let progress = CycleProgress::default();
        assert!(progress.abandon().is_none());

        progress.begin(&CycleSummary::new("c", Utc::now(), false));
        let (a, b) = (file("a.csv", 1), file("b.csv", 2));
        progress.started(&a);
        progress.started(&b);
        progress.finished(&TaskOutcome::failed(
            a.path.clone(),
            Some(a.partition),
            3,
            ClassifiedError::remote_sync(ErrorCode::Connection, "down"),
        ));
        assert_eq!(progress.in_flight(), 1);

        let summary = progress.abandon().expect("running cycle");
        assert_eq!(summary.failed, 2);
        let abandoned = &summary.outcomes[1];
        assert_eq!(abandoned.file, PathBuf::from("b.csv"));
        assert!(abandoned.error.as_ref().is_some_and(ClassifiedError::is_cancelled));
        assert!(!progress.is_running());
    }
}
