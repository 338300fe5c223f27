//! Template context: the serializable rendering payload built from a
//! [`CycleSummary`].

use serde::{Deserialize, Serialize};

use slotsync_core::{CycleSummary, TaskStatus};

use crate::error::RenderError;

/// Flat view of one cycle for the summary templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryContext {
    pub cycle_id: String,
    /// `ok`, `degraded`, `failed`, `fatal` or `dry-run`.
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: i64,
    pub dry_run: bool,
    pub fatal: bool,
    pub totals: TotalsCtx,
    pub files: Vec<FileCtx>,
    /// Failed files only, cancellations included.
    pub failures: Vec<FailureCtx>,
    /// Cycle-level error, rendered `[domain/code] message`.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalsCtx {
    pub files: usize,
    pub succeeded: usize,
    pub skipped_unresolved: usize,
    pub failed: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub changes_applied: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCtx {
    pub name: String,
    pub status: String,
    pub records: usize,
    pub excluded: usize,
    pub changes: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCtx {
    pub name: String,
    pub domain: String,
    pub code: String,
    pub message: String,
    pub attempts: u32,
}

impl SummaryContext {
    pub fn from_summary(summary: &CycleSummary) -> Self {
        let status = if summary.fatal {
            "fatal"
        } else if summary.error.is_some() {
            "failed"
        } else if summary.dry_run {
            "dry-run"
        } else if summary.failed > 0 {
            "degraded"
        } else {
            "ok"
        };

        let files = summary
            .outcomes
            .iter()
            .map(|o| FileCtx {
                name: display_name(&o.file),
                status: o.status.to_string(),
                records: o.records,
                excluded: o.excluded,
                changes: o.changes.total(),
                attempts: o.attempts,
            })
            .collect();

        let failures = summary
            .outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Failed)
            .map(|o| {
                let (domain, code, message) = match &o.error {
                    Some(err) => (err.domain.to_string(), err.code.to_string(), err.message.clone()),
                    None => ("unknown".into(), "unknown".into(), String::new()),
                };
                FailureCtx {
                    name: display_name(&o.file),
                    domain,
                    code,
                    message,
                    attempts: o.attempts,
                }
            })
            .collect();

        SummaryContext {
            cycle_id: summary.cycle_id.clone(),
            status: status.to_string(),
            started_at: summary.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            finished_at: summary.finished_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            duration_secs: (summary.finished_at - summary.started_at).num_seconds().max(0),
            dry_run: summary.dry_run,
            fatal: summary.fatal,
            totals: TotalsCtx {
                files: summary.total_files(),
                succeeded: summary.succeeded,
                skipped_unresolved: summary.skipped_unresolved,
                failed: summary.failed,
                inserts: summary.inserts,
                updates: summary.updates,
                deletes: summary.deletes,
                changes_applied: summary.changes_applied,
            },
            files,
            failures,
            error: summary.error.as_ref().map(ToString::to_string),
        }
    }

    /// Convert to a [`tera::Context`] for rendering.
    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        Ok(tera::Context::from_serialize(self)?)
    }
}

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use slotsync_core::{ChangeCounts, ClassifiedError, ErrorCode, PartitionKey, TaskOutcome};
    use std::path::PathBuf;

    fn outcome(name: &str, status: TaskStatus) -> TaskOutcome {
        TaskOutcome {
            file: PathBuf::from("/data").join(name),
            partition: Some(PartitionKey(1)),
            status,
            records: 4,
            excluded: 1,
            changes: ChangeCounts { inserts: 2, updates: 1, deletes: 0 },
            attempts: 1,
            error: None,
        }
    }

    #[test]
    fn failures_carry_error_tags() {
        let started = Utc::now();
        let mut summary = CycleSummary::new("c-1", started, false);
        summary.record(outcome("reservations_north.csv", TaskStatus::Success));
        summary.record(TaskOutcome::failed(
            PathBuf::from("/data/reservations_south.csv"),
            Some(PartitionKey(3)),
            3,
            ClassifiedError::remote_sync(ErrorCode::Connection, "refused"),
        ));
        summary.finish(started + Duration::seconds(7));

        let ctx = SummaryContext::from_summary(&summary);
        assert_eq!(ctx.status, "degraded");
        assert_eq!(ctx.duration_secs, 7);
        assert_eq!(ctx.files.len(), 2);
        assert_eq!(ctx.files[0].name, "reservations_north.csv");
        assert_eq!(ctx.files[0].changes, 3);
        assert_eq!(ctx.failures.len(), 1);
        assert_eq!(ctx.failures[0].domain, "remote-sync");
        assert_eq!(ctx.failures[0].code, "connection");
        assert_eq!(ctx.failures[0].attempts, 3);
    }

    #[test]
    fn cycle_level_error_marks_summary_failed() {
        let summary = CycleSummary::failed_cycle(
            "c-3",
            Utc::now(),
            false,
            ClassifiedError::source_read(ErrorCode::FileMissing, "/mnt/share: not found"),
        );
        let ctx = SummaryContext::from_summary(&summary);
        assert_eq!(ctx.status, "failed");
        assert_eq!(
            ctx.error.as_deref(),
            Some("[source-read/file_missing] /mnt/share: not found")
        );
        assert!(ctx.files.is_empty());
    }

    #[test]
    fn fatal_wins_over_dry_run_label() {
        let mut summary = CycleSummary::new("c-2", Utc::now(), true);
        summary.fatal = true;
        assert_eq!(SummaryContext::from_summary(&summary).status, "fatal");
        summary.fatal = false;
        assert_eq!(SummaryContext::from_summary(&summary).status, "dry-run");
    }
}
