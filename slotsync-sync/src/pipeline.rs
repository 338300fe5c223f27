//! Shared sync pipeline entrypoint used by CLI and daemon.
//!
//! One cycle: discover source files → fan out file-tasks → close the audit
//! trail with the cycle summary → prune expired audit files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use slotsync_core::{
    ChangeSet, ClassifiedError, Config, CoverageWindow, CycleSummary, ErrorCode, PartitionMap,
};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditWriter, JsonlAuditWriter};
use crate::diff::diff_within;
use crate::discovery::{discover, NamingRules, SourceFile};
use crate::error::CycleError;
use crate::extract::{Extraction, Extractor};
use crate::orchestrator::{CycleProgress, OrchestratorLimits, TaskOrchestrator};
use crate::reader::LockAwareReader;
use crate::retry::RetryPolicy;
use crate::store::{JsonFileStore, RemoteStore};
use crate::task::{PartitionLocks, TaskContext};

/// Collaborators a pipeline is assembled from.
pub struct PipelineParts {
    pub source_dir: PathBuf,
    pub rules: NamingRules,
    pub partitions: PartitionMap,
    pub reader: LockAwareReader,
    pub store: Arc<dyn RemoteStore>,
    pub audit: Arc<dyn AuditWriter>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub limits: OrchestratorLimits,
    pub audit_retention: Duration,
    pub dry_run: bool,
}

impl PipelineParts {
    /// Parts for `config`, with the shipped JSON store and audit writer
    /// resolved under `home`.
    pub fn from_config(
        config: &Config,
        home: &Path,
        dry_run: bool,
    ) -> Result<Self, ClassifiedError> {
        config.validate()?;
        Ok(Self {
            source_dir: config.source_dir.clone(),
            rules: NamingRules::new(config.file_prefix.clone(), &config.file_extensions),
            partitions: config.partition_map()?,
            reader: LockAwareReader::new(config.lock_max_wait(), config.lock_poll_interval()),
            store: Arc::new(JsonFileStore::new(config.store_path_or_default(home))),
            audit: Arc::new(JsonlAuditWriter::new(config.audit_dir_or_default(home))),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                initial_backoff: config.initial_backoff(),
                max_backoff: config.max_backoff(),
            },
            request_timeout: config.request_timeout(),
            limits: OrchestratorLimits {
                max_concurrency: config.max_concurrency,
                failure_threshold: config.failure_threshold,
            },
            audit_retention: config.audit_retention(),
            dry_run,
        })
    }
}

/// Change set one file would produce right now. Never applied.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub file: PathBuf,
    pub extraction: Extraction,
    pub changes: ChangeSet,
}

/// Discovery + orchestration + audit for repeated cycles.
pub struct SyncPipeline {
    source_dir: PathBuf,
    rules: NamingRules,
    partitions: PartitionMap,
    reader: LockAwareReader,
    extractor: Extractor,
    store: Arc<dyn RemoteStore>,
    audit: Arc<dyn AuditWriter>,
    request_timeout: Duration,
    audit_retention: Duration,
    orchestrator: TaskOrchestrator,
    cycle_seq: AtomicU64,
}

impl SyncPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        let extractor = Extractor::new(parts.partitions.clone());
        let ctx = TaskContext {
            reader: parts.reader,
            extractor: extractor.clone(),
            store: Arc::clone(&parts.store),
            audit: Arc::clone(&parts.audit),
            retry: parts.retry,
            request_timeout: parts.request_timeout,
            locks: PartitionLocks::default(),
            dry_run: parts.dry_run,
        };
        Self {
            source_dir: parts.source_dir,
            rules: parts.rules,
            partitions: parts.partitions,
            reader: parts.reader,
            extractor,
            store: parts.store,
            audit: parts.audit,
            request_timeout: parts.request_timeout,
            audit_retention: parts.audit_retention,
            orchestrator: TaskOrchestrator::new(ctx, parts.limits),
            cycle_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        config: &Config,
        home: &Path,
        dry_run: bool,
    ) -> Result<Self, ClassifiedError> {
        Ok(Self::new(PipelineParts::from_config(config, home, dry_run)?))
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn dry_run(&self) -> bool {
        self.orchestrator.dry_run()
    }

    /// Live view of the cycle currently running, if any.
    pub fn progress(&self) -> &CycleProgress {
        self.orchestrator.progress()
    }

    /// Source files the next cycle would process.
    pub async fn discover(&self) -> Result<Vec<SourceFile>, ClassifiedError> {
        let dir = self.source_dir.clone();
        let rules = self.rules.clone();
        let partitions = self.partitions.clone();
        tokio::task::spawn_blocking(move || discover(&dir, &rules, &partitions))
            .await
            .map_err(|e| {
                ClassifiedError::source_read(ErrorCode::Io, format!("discovery worker failed: {e}"))
            })?
    }

    /// Run one full cycle.
    ///
    /// Every cycle's summary is appended to the audit trail (dry runs
    /// excepted), including systemic, cancelled and discovery failures.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, CycleError> {
        let cycle_id = self.next_cycle_id();
        let started_at = Utc::now();
        let result = match self.discover().await {
            Ok(files) => self.orchestrator.run_cycle(&cycle_id, files, cancel).await,
            Err(error) => {
                tracing::error!(cycle_id = %cycle_id, error = %error, "source discovery failed");
                let summary =
                    CycleSummary::failed_cycle(&cycle_id, started_at, self.dry_run(), error.clone());
                Err(CycleError::Discovery {
                    error,
                    summary: Box::new(summary),
                })
            }
        };

        let summary = match &result {
            Ok(summary) => summary,
            Err(err) => err.summary(),
        };
        self.close_audit(summary).await;
        result
    }

    /// Take the summary of a cycle cut off mid-flight (unfinished files
    /// counted as failed) and close its audit trail. `None` when idle.
    pub async fn abandon(&self) -> Option<CycleSummary> {
        let summary = self.progress().abandon()?;
        self.close_audit(&summary).await;
        Some(summary)
    }

    /// Compute the change set for a single file without applying it.
    pub async fn diff_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FileDiff, ClassifiedError> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let partition_name = self.rules.partition_name(file_name);

        let handle = self.reader.open(path, cancel).await?;
        let extractor = self.extractor.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extractor.extract(handle, partition_name.as_deref())
        })
        .await
        .map_err(|e| {
            ClassifiedError::source_read(ErrorCode::Io, format!("extract worker failed: {e}"))
        })??;

        let window = CoverageWindow::from_records(&extraction.records);
        let mut snapshot = Vec::new();
        for (partition, range) in window.ranges() {
            let fetched = tokio::time::timeout(
                self.request_timeout,
                self.store.fetch_snapshot(partition, range),
            )
            .await
            .map_err(|_| {
                ClassifiedError::remote_sync(ErrorCode::Timeout, "fetch_snapshot timed out")
            })??;
            snapshot.extend(fetched);
        }
        let changes = diff_within(&extraction.records, &snapshot, &window);
        Ok(FileDiff {
            file: path.to_path_buf(),
            extraction,
            changes,
        })
    }

    async fn close_audit(&self, summary: &CycleSummary) {
        if summary.dry_run {
            return;
        }
        if let Err(err) = self.audit.append_summary(summary).await {
            tracing::error!(cycle_id = %summary.cycle_id, error = %err, "audit summary failed");
        }
        match self.audit.prune(self.audit_retention, SystemTime::now()) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "pruned expired audit files"),
            Err(err) => tracing::warn!(error = %err, "audit pruning failed"),
        }
    }

    fn next_cycle_id(&self) -> String {
        let seq = self.cycle_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{seq:04}", Utc::now().format("%Y%m%dT%H%M%SZ"))
    }
}
