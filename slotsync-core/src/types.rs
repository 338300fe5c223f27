//! Domain types for reservation-count synchronization.
//!
//! Every type here is plain data: records are immutable once extracted,
//! change sets are built once per file per cycle, and summaries are
//! aggregated by the orchestrator then handed to audit and notification.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClassifiedError;

/// Time-slot label → reservation count. Ordered so serialized payloads and
/// audit lines are stable.
pub type SlotCounts = BTreeMap<String, u32>;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identifier of the physical facility a record belongs to.
///
/// `0` is reserved for "unresolved" and never reaches the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub u32);

impl PartitionKey {
    pub const UNRESOLVED: PartitionKey = PartitionKey(0);

    pub fn is_resolved(self) -> bool {
        self != Self::UNRESOLVED
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for PartitionKey {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A calendar month. Ordered by year, then month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    /// Returns `None` when `month` is outside `1..=12`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Diff key tuple: (partition key, year, month).
///
/// Field order matters: the derived `Ord` is the tie-break order used for
/// change sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition: PartitionKey,
    pub period: Period,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.period)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One reservation-count entry for a facility and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub partition: PartitionKey,
    pub period: Period,
    #[serde(default)]
    pub slots: SlotCounts,
}

impl SourceRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            partition: self.partition,
            period: self.period,
        }
    }
}

/// Inclusive range of periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodRange {
    pub start: Period,
    pub end: Period,
}

impl PeriodRange {
    /// Single-period range.
    pub fn single(period: Period) -> Self {
        Self {
            start: period,
            end: period,
        }
    }

    pub fn contains(&self, period: Period) -> bool {
        self.start <= period && period <= self.end
    }

    fn widen(&mut self, period: Period) {
        self.start = self.start.min(period);
        self.end = self.end.max(period);
    }
}

impl fmt::Display for PeriodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// What one file's extraction claims to cover: for every partition it
/// mentions, the span from its earliest to its latest period.
///
/// Deletes are only ever produced inside the window, so an empty or partial
/// file can never wipe state it does not describe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageWindow {
    ranges: BTreeMap<PartitionKey, PeriodRange>,
}

impl CoverageWindow {
    pub fn from_records(records: &[SourceRecord]) -> Self {
        let mut ranges: BTreeMap<PartitionKey, PeriodRange> = BTreeMap::new();
        for record in records.iter().filter(|r| r.partition.is_resolved()) {
            ranges
                .entry(record.partition)
                .and_modify(|range| range.widen(record.period))
                .or_insert_with(|| PeriodRange::single(record.period));
        }
        Self { ranges }
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.ranges
            .get(&key.partition)
            .is_some_and(|range| range.contains(key.period))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Covered partitions, ascending.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionKey> + '_ {
        self.ranges.keys().copied()
    }

    pub fn ranges(&self) -> impl Iterator<Item = (PartitionKey, PeriodRange)> + '_ {
        self.ranges.iter().map(|(k, r)| (*k, *r))
    }
}

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// Kind of a single change. Declaration order is the change-set group order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// One row-level change. Updates carry the whole before/after slot maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub key: RecordKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<SlotCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<SlotCounts>,
}

impl Change {
    pub fn insert(record: SourceRecord) -> Self {
        Self {
            kind: ChangeKind::Insert,
            key: record.key(),
            before: None,
            after: Some(record.slots),
        }
    }

    pub fn update(key: RecordKey, before: SlotCounts, after: SlotCounts) -> Self {
        Self {
            kind: ChangeKind::Update,
            key,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(record: SourceRecord) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key: record.key(),
            before: Some(record.slots),
            after: None,
        }
    }
}

/// Insert/update/delete tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

/// Ordered change set: inserts, then updates, then deletes, each group
/// ascending by [`RecordKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Build a change set, normalizing to the canonical order.
    pub fn from_changes(mut changes: Vec<Change>) -> Self {
        changes.sort_by(|a, b| (a.kind, a.key).cmp(&(b.kind, b.key)));
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for change in &self.changes {
            match change.kind {
                ChangeKind::Insert => counts.inserts += 1,
                ChangeKind::Update => counts.updates += 1,
                ChangeKind::Delete => counts.deletes += 1,
            }
        }
        counts
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

// ---------------------------------------------------------------------------
// Task state and outcomes
// ---------------------------------------------------------------------------

/// Terminal status of one file-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    SkippedUnresolved,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::SkippedUnresolved => write!(f, "skipped_unresolved"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// File-task state machine.
///
/// ```text
/// Pending -> Reading -> Extracting -> Diffing -> Syncing -> AuditWriting -> Done(Success)
///            any non-terminal state -> Retrying -> Reading
///            any non-terminal state -> Done(Failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTaskState {
    Pending,
    Reading,
    Extracting,
    Diffing,
    Syncing,
    AuditWriting,
    Retrying,
    Done(TaskStatus),
}

impl FileTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileTaskState::Done(_))
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: FileTaskState) -> bool {
        use FileTaskState::*;
        match (self, next) {
            (Done(_), _) => false,
            (_, Done(TaskStatus::Failed)) => true,
            (Retrying, Reading) => true,
            (Retrying, _) => false,
            (_, Retrying) => true,
            (Pending, Reading)
            | (Reading, Extracting)
            | (Extracting, Diffing)
            | (Diffing, Syncing)
            | (Syncing, AuditWriting)
            | (AuditWriting, Done(TaskStatus::Success)) => true,
            // Nothing resolved: the file short-circuits after extraction.
            (Extracting, Done(TaskStatus::SkippedUnresolved)) => true,
            // Empty change set or dry run: nothing to sync or audit.
            (Diffing, Done(TaskStatus::Success)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FileTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTaskState::Pending => write!(f, "pending"),
            FileTaskState::Reading => write!(f, "reading"),
            FileTaskState::Extracting => write!(f, "extracting"),
            FileTaskState::Diffing => write!(f, "diffing"),
            FileTaskState::Syncing => write!(f, "syncing"),
            FileTaskState::AuditWriting => write!(f, "audit_writing"),
            FileTaskState::Retrying => write!(f, "retrying"),
            FileTaskState::Done(status) => write!(f, "done({status})"),
        }
    }
}

/// Per-file result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionKey>,
    pub status: TaskStatus,
    /// Records that survived partition resolution.
    pub records: usize,
    /// Rows dropped because their partition could not be resolved.
    pub excluded: usize,
    pub changes: ChangeCounts,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
}

impl TaskOutcome {
    pub fn failed(
        file: PathBuf,
        partition: Option<PartitionKey>,
        attempts: u32,
        error: ClassifiedError,
    ) -> Self {
        Self {
            file,
            partition,
            status: TaskStatus::Failed,
            records: 0,
            excluded: 0,
            changes: ChangeCounts::default(),
            attempts,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

/// Aggregate of one cycle; the unit handed to notification and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub skipped_unresolved: usize,
    pub failed: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Changes committed to the store. Always `0` on a dry run.
    pub changes_applied: usize,
    pub dry_run: bool,
    /// Set when the cycle was cut short by the systemic-failure threshold.
    pub fatal: bool,
    /// Cycle-level failure that kept any file from being processed, such as
    /// an unreadable source directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    #[serde(default)]
    pub outcomes: Vec<TaskOutcome>,
}

impl CycleSummary {
    pub fn new(cycle_id: impl Into<String>, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            started_at,
            finished_at: started_at,
            succeeded: 0,
            skipped_unresolved: 0,
            failed: 0,
            inserts: 0,
            updates: 0,
            deletes: 0,
            changes_applied: 0,
            dry_run,
            fatal: false,
            error: None,
            outcomes: Vec::new(),
        }
    }

    /// Summary of a cycle that failed before any file-task started.
    pub fn failed_cycle(
        cycle_id: impl Into<String>,
        started_at: DateTime<Utc>,
        dry_run: bool,
        error: ClassifiedError,
    ) -> Self {
        let mut summary = Self::new(cycle_id, started_at, dry_run);
        summary.error = Some(error);
        summary.finish(Utc::now());
        summary
    }

    /// Fold one file outcome into the totals.
    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome.status {
            TaskStatus::Success => {
                self.succeeded += 1;
                self.inserts += outcome.changes.inserts;
                self.updates += outcome.changes.updates;
                self.deletes += outcome.changes.deletes;
                if !self.dry_run {
                    self.changes_applied += outcome.changes.total();
                }
            }
            TaskStatus::SkippedUnresolved => self.skipped_unresolved += 1,
            TaskStatus::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn total_files(&self) -> usize {
        self.succeeded + self.skipped_unresolved + self.failed
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.outcomes.sort_by(|a, b| a.file.cmp(&b.file));
        self.finished_at = finished_at;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClassifiedError, ErrorCode};

    fn key(partition: u32, year: i32, month: u32) -> RecordKey {
        RecordKey {
            partition: PartitionKey(partition),
            period: Period::new(year, month).expect("valid month"),
        }
    }

    #[test]
    fn period_rejects_out_of_range_month() {
        assert!(Period::new(2024, 0).is_none());
        assert!(Period::new(2024, 13).is_none());
        assert_eq!(Period::new(2024, 3).map(|p| p.to_string()), Some("2024-03".into()));
    }

    #[test]
    fn record_key_orders_by_partition_then_year_then_month() {
        let mut keys = vec![key(2, 2023, 1), key(1, 2024, 2), key(1, 2024, 1), key(1, 2023, 12)];
        keys.sort();
        assert_eq!(
            keys,
            vec![key(1, 2023, 12), key(1, 2024, 1), key(1, 2024, 2), key(2, 2023, 1)]
        );
    }

    #[test]
    fn coverage_window_spans_min_to_max_period_per_partition() {
        let rec = |p, y, m| SourceRecord {
            partition: PartitionKey(p),
            period: Period::new(y, m).expect("month"),
            slots: SlotCounts::new(),
        };
        let window = CoverageWindow::from_records(&[
            rec(1, 2024, 3),
            rec(1, 2023, 11),
            rec(2, 2024, 6),
            rec(0, 2020, 1),
        ]);
        assert!(window.contains(&key(1, 2024, 1)));
        assert!(window.contains(&key(1, 2023, 11)));
        assert!(!window.contains(&key(1, 2024, 4)));
        assert!(!window.contains(&key(2, 2024, 5)));
        assert!(!window.contains(&key(0, 2020, 1)));
        assert_eq!(window.partitions().collect::<Vec<_>>(), vec![PartitionKey(1), PartitionKey(2)]);
    }

    #[test]
    fn change_set_normalizes_group_order() {
        let rec = |p| SourceRecord {
            partition: PartitionKey(p),
            period: Period::new(2024, 1).expect("month"),
            slots: SlotCounts::new(),
        };
        let set = ChangeSet::from_changes(vec![
            Change::delete(rec(1)),
            Change::insert(rec(3)),
            Change::update(key(2, 2024, 1), SlotCounts::new(), SlotCounts::new()),
            Change::insert(rec(1)),
        ]);
        let order: Vec<_> = set.iter().map(|c| (c.kind, c.key.partition.0)).collect();
        assert_eq!(
            order,
            vec![
                (ChangeKind::Insert, 1),
                (ChangeKind::Insert, 3),
                (ChangeKind::Update, 2),
                (ChangeKind::Delete, 1),
            ]
        );
        assert_eq!(
            set.counts(),
            ChangeCounts {
                inserts: 2,
                updates: 1,
                deletes: 1
            }
        );
    }

    #[test]
    fn state_machine_edges() {
        use FileTaskState::*;
        assert!(Pending.can_transition_to(Reading));
        assert!(AuditWriting.can_transition_to(Done(TaskStatus::Success)));
        assert!(Syncing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Reading));
        assert!(!Retrying.can_transition_to(Syncing));
        assert!(!Pending.can_transition_to(Syncing));
        assert!(!Done(TaskStatus::Success).can_transition_to(Reading));
        assert!(Diffing.can_transition_to(Done(TaskStatus::Failed)));
    }

    #[test]
    fn summary_counts_only_successful_changes() {
        let mut summary = CycleSummary::new("c1", Utc::now(), false);
        summary.record(TaskOutcome {
            file: PathBuf::from("b.csv"),
            partition: Some(PartitionKey(1)),
            status: TaskStatus::Success,
            records: 3,
            excluded: 0,
            changes: ChangeCounts {
                inserts: 2,
                updates: 1,
                deletes: 0,
            },
            attempts: 1,
            error: None,
        });
        summary.record(TaskOutcome::failed(
            PathBuf::from("a.csv"),
            Some(PartitionKey(2)),
            3,
            ClassifiedError::remote_sync(ErrorCode::Connection, "store unreachable"),
        ));
        summary.finish(Utc::now());

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.changes_applied, 3);
        assert_eq!(summary.total_files(), 2);
        assert_eq!(summary.outcomes[0].file, PathBuf::from("a.csv"));
    }

    #[test]
    fn dry_run_summary_never_reports_applied_changes() {
        let mut summary = CycleSummary::new("c2", Utc::now(), true);
        summary.record(TaskOutcome {
            file: PathBuf::from("a.csv"),
            partition: Some(PartitionKey(1)),
            status: TaskStatus::Success,
            records: 1,
            excluded: 0,
            changes: ChangeCounts {
                inserts: 1,
                updates: 0,
                deletes: 0,
            },
            attempts: 1,
            error: None,
        });
        assert_eq!(summary.inserts, 1);
        assert_eq!(summary.changes_applied, 0);
    }
}
