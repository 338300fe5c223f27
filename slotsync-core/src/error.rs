//! Classified errors shared by every slotsync crate.
//!
//! A [`ClassifiedError`] is one flat value tagged with a domain, a
//! machine-readable code, a severity and a retryable flag. Retry loops and
//! escalation rules look only at those tags, never at the message.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which collaborator an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    SourceRead,
    RemoteSync,
    Notification,
    Configuration,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::SourceRead => write!(f, "source-read"),
            ErrorDomain::RemoteSync => write!(f, "remote-sync"),
            ErrorDomain::Notification => write!(f, "notification"),
            ErrorDomain::Configuration => write!(f, "configuration"),
        }
    }
}

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // source-read
    FileMissing,
    FileLocked,
    Malformed,
    // remote-sync / notification
    Auth,
    Connection,
    DataOperation,
    Send,
    // configuration
    MissingKey,
    InvalidValue,
    MissingFile,
    // any domain
    Timeout,
    Cancelled,
    Io,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FileMissing => "file_missing",
            ErrorCode::FileLocked => "file_locked",
            ErrorCode::Malformed => "malformed",
            ErrorCode::Auth => "auth",
            ErrorCode::Connection => "connection",
            ErrorCode::DataOperation => "data_operation",
            ErrorCode::Send => "send",
            ErrorCode::MissingKey => "missing_key",
            ErrorCode::InvalidValue => "invalid_value",
            ErrorCode::MissingFile => "missing_file",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Io => "io",
        }
    }

    /// Default retryability when a call site does not override it.
    fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::FileLocked | ErrorCode::Connection | ErrorCode::Timeout | ErrorCode::Io
        )
    }

    fn default_severity(self) -> ErrorSeverity {
        match self {
            ErrorCode::Cancelled => ErrorSeverity::Info,
            ErrorCode::FileLocked | ErrorCode::Timeout => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity, ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "info"),
            ErrorSeverity::Warning => write!(f, "warning"),
            ErrorSeverity::Error => write!(f, "error"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// The universal error value passed between components.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{domain}/{code}] {message}")]
pub struct ClassifiedError {
    pub domain: ErrorDomain,
    pub code: ErrorCode,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub message: String,
}

impl ClassifiedError {
    /// Build an error with the code's default severity and retryability.
    pub fn new(domain: ErrorDomain, code: ErrorCode, message: impl Into<String>) -> Self {
        let (severity, retryable) = match domain {
            // Configuration errors: always Critical, never retryable.
            ErrorDomain::Configuration => (ErrorSeverity::Critical, false),
            _ => (code.default_severity(), code.default_retryable()),
        };
        Self {
            domain,
            code,
            severity,
            retryable,
            message: message.into(),
        }
    }

    pub fn source_read(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::SourceRead, code, message)
    }

    pub fn remote_sync(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::RemoteSync, code, message)
    }

    pub fn notification(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Notification, code, message)
    }

    pub fn configuration(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Configuration, code, message)
    }

    /// Cooperative-cancellation marker for `domain`.
    pub fn cancelled(domain: ErrorDomain, what: impl fmt::Display) -> Self {
        Self::new(domain, ErrorCode::Cancelled, format!("{what} cancelled"))
    }

    /// Map an I/O error on `path` to a source-read error.
    pub fn from_source_io(path: &Path, err: &std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::FileMissing,
            std::io::ErrorKind::WouldBlock => ErrorCode::FileLocked,
            std::io::ErrorKind::InvalidData => ErrorCode::Malformed,
            _ => ErrorCode::Io,
        };
        Self::source_read(code, format!("{}: {err}", path.display()))
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_domain_and_code() {
        let err = ClassifiedError::remote_sync(ErrorCode::Connection, "refused");
        assert_eq!(err.to_string(), "[remote-sync/connection] refused");
    }

    #[test]
    fn configuration_errors_are_critical_and_never_retryable() {
        let err = ClassifiedError::configuration(ErrorCode::Timeout, "bad timeout");
        assert!(!err.retryable);
        assert!(err.is_critical());
    }

    #[test]
    fn lock_and_connection_errors_default_to_retryable() {
        assert!(ClassifiedError::source_read(ErrorCode::FileLocked, "x").retryable);
        assert!(ClassifiedError::remote_sync(ErrorCode::Connection, "x").retryable);
        assert!(!ClassifiedError::source_read(ErrorCode::Malformed, "x").retryable);
        assert!(!ClassifiedError::remote_sync(ErrorCode::Auth, "x").retryable);
    }

    #[test]
    fn cancellation_is_informational() {
        let err = ClassifiedError::cancelled(ErrorDomain::SourceRead, "lock wait");
        assert!(err.is_cancelled());
        assert!(!err.retryable);
        assert_eq!(err.severity, ErrorSeverity::Info);
    }

    #[test]
    fn io_not_found_maps_to_file_missing() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = ClassifiedError::from_source_io(Path::new("/tmp/x.csv"), &io);
        assert_eq!(err.code, ErrorCode::FileMissing);
        assert!(!err.retryable);
    }

    #[test]
    fn serializes_with_snake_case_tags() {
        let err = ClassifiedError::source_read(ErrorCode::FileLocked, "busy");
        let yaml = serde_yaml::to_string(&err).expect("serialize");
        assert!(yaml.contains("source_read"));
        assert!(yaml.contains("file_locked"));
    }
}
