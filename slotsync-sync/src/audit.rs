//! Append-only audit trail.
//!
//! One JSON-lines file per cycle, `<audit_dir>/cycle-<cycle_id>.jsonl`.
//! Each applied change is one `change` line; the cycle closes with a single
//! `summary` line. Files older than the retention window are pruned.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotsync_core::{
    ChangeKind, ChangeSet, ClassifiedError, CycleSummary, ErrorCode, PartitionKey, Period,
    SlotCounts,
};
use tokio::sync::Mutex;

/// Audit payload for one file's applied change set.
#[derive(Debug, Clone)]
pub struct FileAudit {
    pub cycle_id: String,
    pub file: PathBuf,
    /// SHA-256 of the source content the changes were computed from.
    pub digest: String,
    pub changes: ChangeSet,
}

/// Durable record of applied changes.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Append one file's changes. Returns the audit file written to.
    async fn append(&self, audit: &FileAudit) -> Result<PathBuf, ClassifiedError>;

    /// Close the cycle's trail with its summary.
    async fn append_summary(&self, summary: &CycleSummary) -> Result<PathBuf, ClassifiedError>;

    /// Remove audit records older than `now - retention`; returns how many
    /// were removed.
    fn prune(&self, _retention: Duration, _now: SystemTime) -> Result<usize, ClassifiedError> {
        Ok(0)
    }
}

/// One line of an audit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditLine {
    Change {
        ts: DateTime<Utc>,
        cycle_id: String,
        file: PathBuf,
        digest: String,
        kind: ChangeKind,
        partition: PartitionKey,
        period: Period,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<SlotCounts>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<SlotCounts>,
    },
    Summary {
        ts: DateTime<Utc>,
        cycle_id: String,
        succeeded: usize,
        skipped_unresolved: usize,
        failed: usize,
        changes_applied: usize,
        dry_run: bool,
        fatal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ClassifiedError>,
    },
}

// ---------------------------------------------------------------------------
// JsonlAuditWriter
// ---------------------------------------------------------------------------

/// JSON-lines audit files under one directory.
#[derive(Debug)]
pub struct JsonlAuditWriter {
    dir: PathBuf,
    /// Serializes appends per audit file across concurrent file-tasks.
    files: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl JsonlAuditWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/cycle-<cycle_id>.jsonl` — pure, no I/O.
    pub fn cycle_path(&self, cycle_id: &str) -> PathBuf {
        self.dir.join(format!("cycle-{cycle_id}.jsonl"))
    }

    async fn write_lines(
        &self,
        path: PathBuf,
        lines: Vec<AuditLine>,
    ) -> Result<PathBuf, ClassifiedError> {
        let file_lock = {
            let mut files = self.files.lock().await;
            files.entry(path.clone()).or_default().clone()
        };
        let _guard = file_lock.lock().await;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || append_lines(&dir, &path, &lines).map(|()| path))
            .await
            .map_err(|e| {
                ClassifiedError::source_read(ErrorCode::Io, format!("audit worker failed: {e}"))
            })?
    }
}

#[async_trait]
impl AuditWriter for JsonlAuditWriter {
    async fn append(&self, audit: &FileAudit) -> Result<PathBuf, ClassifiedError> {
        let ts = Utc::now();
        let lines = audit
            .changes
            .iter()
            .map(|change| AuditLine::Change {
                ts,
                cycle_id: audit.cycle_id.clone(),
                file: audit.file.clone(),
                digest: audit.digest.clone(),
                kind: change.kind,
                partition: change.key.partition,
                period: change.key.period,
                before: change.before.clone(),
                after: change.after.clone(),
            })
            .collect();
        self.write_lines(self.cycle_path(&audit.cycle_id), lines).await
    }

    async fn append_summary(&self, summary: &CycleSummary) -> Result<PathBuf, ClassifiedError> {
        let line = AuditLine::Summary {
            ts: Utc::now(),
            cycle_id: summary.cycle_id.clone(),
            succeeded: summary.succeeded,
            skipped_unresolved: summary.skipped_unresolved,
            failed: summary.failed,
            changes_applied: summary.changes_applied,
            dry_run: summary.dry_run,
            fatal: summary.fatal,
            error: summary.error.clone(),
        };
        let path = self.cycle_path(&summary.cycle_id);
        let written = self.write_lines(path.clone(), vec![line]).await?;
        // Summary is the last line of a cycle.
        self.files.lock().await.remove(&path);
        Ok(written)
    }

    /// Delete audit files last modified before `now - retention`.
    ///
    /// Returns the number of files removed. Non-audit files are left alone.
    fn prune(&self, retention: Duration, now: SystemTime) -> Result<usize, ClassifiedError> {
        let Some(cutoff) = now.checked_sub(retention) else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(audit_io(&self.dir, &e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_audit = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("cycle-") && n.ends_with(".jsonl"));
            if !is_audit {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| audit_io(&path, &e))?;
            if modified < cutoff {
                std::fs::remove_file(&path).map_err(|e| audit_io(&path, &e))?;
                tracing::debug!(file = %path.display(), "pruned audit file");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Read every line of an audit file.
pub fn read_audit_file(path: &Path) -> Result<Vec<AuditLine>, ClassifiedError> {
    let contents = std::fs::read_to_string(path).map_err(|e| audit_io(path, &e))?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| {
                ClassifiedError::source_read(
                    ErrorCode::Malformed,
                    format!("{}: bad audit line: {e}", path.display()),
                )
            })
        })
        .collect()
}

fn append_lines(dir: &Path, path: &Path, lines: &[AuditLine]) -> Result<(), ClassifiedError> {
    std::fs::create_dir_all(dir).map_err(|e| audit_io(dir, &e))?;
    let mut buf = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut buf, line).map_err(|e| {
            ClassifiedError::source_read(ErrorCode::Malformed, format!("serialize audit line: {e}"))
        })?;
        buf.push(b'\n');
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| audit_io(path, &e))?;
    file.write_all(&buf).map_err(|e| audit_io(path, &e))?;
    file.sync_data().map_err(|e| audit_io(path, &e))?;
    Ok(())
}

/// Audit files are local, so their faults carry the local-I/O domain
/// (source-read), never remote-sync.
fn audit_io(path: &Path, err: &std::io::Error) -> ClassifiedError {
    ClassifiedError::source_read(ErrorCode::Io, format!("audit {}: {err}", path.display()))
}
