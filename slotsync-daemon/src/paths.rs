use std::path::{Path, PathBuf};
use std::time::Duration;

use slotsync_core::config::slotsync_root;

/// Quiet period before a burst of source-directory events triggers a cycle.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Set to `1` or `true` for JSON log lines.
pub const LOG_JSON_ENV: &str = "SLOTSYNC_LOG_JSON";

pub fn socket_path(home: &Path) -> PathBuf {
    slotsync_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    slotsync_root(home).join("logs")
}

/// Every event at or above the configured filter.
pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

/// Warnings and errors only.
pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}
