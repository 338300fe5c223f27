//! # slotsync-sync
//!
//! Extraction and synchronization pipeline.
//!
//! Call [`SyncPipeline::run_cycle`] to discover every source sheet, diff it
//! against the remote store and apply the changes, or
//! [`SyncPipeline::diff_file`] to preview a single file.
//!
//! - [`reader`] — lock-aware source reader
//! - [`extract`] — sheet parsing and partition resolution
//! - [`diff`] — change-set computation
//! - [`task`] / [`orchestrator`] — per-file state machine and bounded fan-out
//! - [`store`] / [`audit`] — remote-store and audit boundaries

pub mod audit;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod store;
pub mod task;

pub use audit::{AuditLine, AuditWriter, FileAudit, JsonlAuditWriter};
pub use diff::{diff, diff_within};
pub use discovery::{NamingRules, SourceFile};
pub use error::CycleError;
pub use extract::{DelimitedSheetParser, Extraction, Extractor, SheetParser, SheetRow};
pub use orchestrator::{CycleProgress, OrchestratorLimits, TaskOrchestrator};
pub use pipeline::{FileDiff, PipelineParts, SyncPipeline};
pub use reader::{LockAwareReader, SourceHandle};
pub use retry::RetryPolicy;
pub use store::{JsonFileStore, RemoteStore, StoreDocument};
pub use task::{FileTask, PartitionLocks, TaskContext};
