//! Size-based rotation for the daemon's log files.
//!
//! `daemon.log` and `daemon-err.log` under `~/.slotsync/logs/` are rotated
//! once they reach 10 MiB, keeping at most 5 copies:
//!   daemon.log → daemon.log.1 → daemon.log.2 → … → daemon.log.5
//!
//! The tracing writer reopens the log per event, so a rotated file is picked
//! up without restarting the daemon.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rotate once a log reaches this size (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` if its size is at least `max_bytes`.
///
/// Returns `true` if rotation occurred, `false` when the file is under the
/// threshold or does not exist yet.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    fs::File::create(log_path)?;
    Ok(true)
}

/// Rotate both daemon logs under `home`. A failure on one file is logged and
/// does not block the other.
pub fn rotate_logs(home: &Path) {
    let logs = [
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ];
    for log_path in &logs {
        match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

/// `daemon.log` + 2 → `daemon.log.2`.
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(crate::paths::DAEMON_STDOUT_LOG);
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL_LIMIT: u64 = 64;

    fn write_log(path: &Path, bytes: usize, fill: u8) {
        fs::write(path, vec![fill; bytes]).unwrap();
    }

    #[test]
    fn under_threshold_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, 10, b'a');
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, SMALL_LIMIT as usize + 1, b'a');

        assert!(rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            SMALL_LIMIT + 1
        );
    }

    #[test]
    fn copies_shift_and_oldest_is_dropped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon-err.log");
        for round in 0..4u8 {
            write_log(&log, SMALL_LIMIT as usize, b'0' + round);
            rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap();
        }
        // Rounds 1..=3 survive, newest first; round 0 fell off the end.
        for (n, round) in [(1, 3u8), (2, 2), (3, 1)] {
            let contents = fs::read(numbered_path(&log, n)).unwrap();
            assert_eq!(contents[0], b'0' + round, "copy .{n}");
        }
        assert!(!numbered_path(&log, 4).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(!rotate_if_needed(&dir.path().join("absent.log"), SMALL_LIMIT, 3).unwrap());
    }
}
