//! slotsync core library — domain types, classified errors, partitions, config.
//!
//! - [`types`] — records, change sets, task outcomes, cycle summaries
//! - [`error`] — [`ClassifiedError`], the error currency shared by every crate
//! - [`partition`] — partition name → key resolution
//! - [`config`] — YAML service configuration

pub mod config;
pub mod error;
pub mod partition;
pub mod types;

pub use config::Config;
pub use error::{ClassifiedError, ErrorCode, ErrorDomain, ErrorSeverity};
pub use partition::PartitionMap;
pub use types::{
    Change, ChangeCounts, ChangeKind, ChangeSet, CoverageWindow, CycleSummary, FileTaskState,
    PartitionKey, Period, PeriodRange, RecordKey, SlotCounts, SourceRecord, TaskOutcome,
    TaskStatus,
};
