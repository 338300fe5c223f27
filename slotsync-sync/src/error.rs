//! Error types for slotsync-sync.
//!
//! Per-file failures never surface here: they are folded into the
//! [`CycleSummary`] as `Failed` outcomes. A [`CycleError`] means the cycle as
//! a whole could not complete normally; it still carries that cycle's
//! summary.

use slotsync_core::{ClassifiedError, CycleSummary};
use thiserror::Error;

/// Cycle-level failures.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Failed files crossed the systemic-failure threshold; remaining files
    /// were never started.
    #[error("systemic failure: {failed} file(s) failed, threshold is {threshold}")]
    Systemic {
        failed: usize,
        threshold: usize,
        summary: Box<CycleSummary>,
    },

    /// The cycle's cancellation token fired before every file finished.
    #[error("cycle {} cancelled", summary.cycle_id)]
    Cancelled { summary: Box<CycleSummary> },

    /// The source directory could not be listed. The summary carries the
    /// error and no outcomes.
    #[error("discovery failed: {error}")]
    Discovery {
        #[source]
        error: ClassifiedError,
        summary: Box<CycleSummary>,
    },
}

impl CycleError {
    /// The (partial) summary every failed cycle still produces.
    pub fn summary(&self) -> &CycleSummary {
        match self {
            CycleError::Systemic { summary, .. }
            | CycleError::Cancelled { summary }
            | CycleError::Discovery { summary, .. } => summary,
        }
    }

    pub fn into_summary(self) -> CycleSummary {
        match self {
            CycleError::Systemic { summary, .. }
            | CycleError::Cancelled { summary }
            | CycleError::Discovery { summary, .. } => *summary,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Systemic { .. })
    }
}
