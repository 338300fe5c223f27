//! Error types for slotsync-notifier.

use std::path::PathBuf;

use slotsync_core::{ClassifiedError, ErrorCode};
use thiserror::Error;

/// Failures while turning a cycle summary into text.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("summary template error: {0}")]
    Tera(#[from] tera::Error),

    #[error("summary context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading a template override failed.
    #[error("template override io error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

impl From<RenderError> for ClassifiedError {
    /// Surfaces as a non-retryable notification `send` error.
    fn from(err: RenderError) -> Self {
        ClassifiedError::notification(ErrorCode::Send, err.to_string()).with_retryable(false)
    }
}
