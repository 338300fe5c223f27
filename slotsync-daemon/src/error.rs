use std::path::PathBuf;

use slotsync_core::ClassifiedError;
use slotsync_sync::CycleError;
use thiserror::Error;

/// Error surface for the lifecycle controller, runtime and socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration or setup failure.
    #[error("{0}")]
    Classified(#[from] ClassifiedError),

    /// A cycle ended early without crossing the systemic threshold.
    #[error("cycle did not complete: {0}")]
    Cycle(#[source] CycleError),

    /// Systemic failure; the daemon schedules no further cycles.
    #[error(
        "fatal: {failed} file(s) failed (threshold {threshold}); no further cycles will run"
    )]
    Fatal { failed: usize, threshold: usize },

    #[error("cycle abandoned at the shutdown deadline")]
    Abandoned,

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
