//! Service configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.slotsync/
//!   config.yaml     (mode 0600, written by `slotsync init`)
//!   store.json      (default JsonFileStore document)
//!   audit/          (default audit directory)
//!   logs/           (daemon stdout/stderr logs)
//! ```
//!
//! # API pattern
//!
//! Every function that touches disk has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClassifiedError, ErrorCode};
use crate::partition::PartitionMap;

/// Hosts kill the service 30 s after a stop request; the shutdown deadline
/// must stay strictly below that.
pub const FORCED_KILL_LIMIT_SECS: u64 = 30;

const CONFIG_FILE: &str = "config.yaml";

/// Runtime configuration, deserialized from `~/.slotsync/config.yaml`.
///
/// Durations are stored as integer fields so the YAML stays hand-editable;
/// use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory scanned for source sheets each cycle.
    pub source_dir: PathBuf,
    /// File names must start with this prefix; the rest of the stem is the
    /// partition name (`reservations_north.csv` → `north`).
    pub file_prefix: String,
    /// Accepted extensions, lowercase, without the dot.
    pub file_extensions: Vec<String>,
    /// Facility name → partition key.
    pub partitions: BTreeMap<String, u32>,

    pub max_concurrency: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A cycle with more failed files than this is treated as systemic.
    pub failure_threshold: usize,

    pub lock_max_wait_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub cycle_interval_secs: u64,
    pub shutdown_deadline_secs: u64,
    /// Trigger an early cycle when the source directory changes.
    pub watch_source_dir: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_dir: Option<PathBuf>,
    pub audit_retention_days: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            file_prefix: "reservations_".to_string(),
            file_extensions: vec!["csv".to_string(), "tsv".to_string()],
            partitions: [("north", 1), ("central", 2), ("south", 3)]
                .into_iter()
                .map(|(name, key)| (name.to_string(), key))
                .collect(),
            max_concurrency: 4,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            failure_threshold: 5,
            lock_max_wait_ms: 30_000,
            lock_poll_interval_ms: 500,
            request_timeout_secs: 20,
            cycle_interval_secs: 300,
            shutdown_deadline_secs: 20,
            watch_source_dir: true,
            store_path: None,
            audit_dir: None,
            audit_retention_days: 30,
            webhook_url: None,
            template_dir: None,
        }
    }
}

impl Config {
    /// Check every invariant the runtime relies on.
    pub fn validate(&self) -> Result<(), ClassifiedError> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(missing("source_dir"));
        }
        if self.file_extensions.is_empty() {
            return Err(missing("file_extensions"));
        }
        if self.partitions.is_empty() {
            return Err(missing("partitions"));
        }
        self.partition_map()?;

        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(
                "initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(invalid("lock_poll_interval_ms", "must be positive"));
        }
        if self.lock_poll_interval_ms > self.lock_max_wait_ms {
            return Err(invalid(
                "lock_poll_interval_ms",
                "must not exceed lock_max_wait_ms",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be positive"));
        }
        if self.cycle_interval_secs == 0 {
            return Err(invalid("cycle_interval_secs", "must be positive"));
        }
        if self.shutdown_deadline_secs == 0 || self.shutdown_deadline_secs >= FORCED_KILL_LIMIT_SECS {
            return Err(invalid(
                "shutdown_deadline_secs",
                &format!("must be between 1 and {}", FORCED_KILL_LIMIT_SECS - 1),
            ));
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid("webhook_url", "must be an http(s) URL"));
            }
        }
        Ok(())
    }

    pub fn partition_map(&self) -> Result<PartitionMap, ClassifiedError> {
        PartitionMap::new(self.partitions.iter().map(|(name, key)| (name, *key)))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn lock_max_wait(&self) -> Duration {
        Duration::from_millis(self.lock_max_wait_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.audit_retention_days) * 24 * 60 * 60)
    }

    /// Configured store path, or `<home>/.slotsync/store.json`.
    pub fn store_path_or_default(&self, home: &Path) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| slotsync_root(home).join("store.json"))
    }

    /// Configured audit directory, or `<home>/.slotsync/audit`.
    pub fn audit_dir_or_default(&self, home: &Path) -> PathBuf {
        self.audit_dir
            .clone()
            .unwrap_or_else(|| slotsync_root(home).join("audit"))
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.slotsync`
pub fn slotsync_root(home: &Path) -> PathBuf {
    home.join(".slotsync")
}

/// `<home>/.slotsync/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    slotsync_root(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Load / save / init
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.slotsync/config.yaml`.
pub fn load_at(home: &Path) -> Result<Config, ClassifiedError> {
    let path = config_path_at(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ClassifiedError::configuration(
                ErrorCode::MissingFile,
                format!("config not found at {}; run `slotsync init`", path.display()),
            ));
        }
        Err(err) => {
            return Err(ClassifiedError::configuration(
                ErrorCode::Io,
                format!("{}: {err}", path.display()),
            ));
        }
    };
    let config: Config = serde_yaml::from_str(&contents).map_err(|err| {
        ClassifiedError::configuration(
            ErrorCode::InvalidValue,
            format!("failed to parse {}: {err}", path.display()),
        )
    })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ClassifiedError> {
    load_at(&home()?)
}

/// Atomically write `config` to `<home>/.slotsync/config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ClassifiedError> {
    let root = slotsync_root(home);
    std::fs::create_dir_all(&root).map_err(|e| config_io(&root, &e))?;
    set_dir_permissions(&root)?;

    let path = config_path_at(home);
    let tmp = root.join(format!("{CONFIG_FILE}.tmp"));
    let yaml = serde_yaml::to_string(config).map_err(|err| {
        ClassifiedError::configuration(ErrorCode::InvalidValue, format!("serialize config: {err}"))
    })?;
    std::fs::write(&tmp, yaml).map_err(|e| config_io(&tmp, &e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| config_io(&path, &e))?;
    Ok(())
}

/// Write a default config pointing at `source_dir`.
///
/// Idempotent: an existing config is loaded and returned unchanged.
pub fn init_at(home: &Path, source_dir: PathBuf) -> Result<Config, ClassifiedError> {
    if config_path_at(home).exists() {
        return load_at(home);
    }
    let config = Config {
        source_dir,
        ..Config::default()
    };
    config.validate()?;
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(source_dir: PathBuf) -> Result<Config, ClassifiedError> {
    init_at(&home()?, source_dir)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ClassifiedError> {
    dirs::home_dir().ok_or_else(|| {
        ClassifiedError::configuration(
            ErrorCode::MissingKey,
            "cannot determine home directory; set $HOME or equivalent",
        )
    })
}

fn missing(field: &str) -> ClassifiedError {
    ClassifiedError::configuration(ErrorCode::MissingKey, format!("`{field}` is required"))
}

fn invalid(field: &str, reason: &str) -> ClassifiedError {
    ClassifiedError::configuration(ErrorCode::InvalidValue, format!("`{field}` {reason}"))
}

fn config_io(path: &Path, err: &std::io::Error) -> ClassifiedError {
    ClassifiedError::configuration(ErrorCode::Io, format!("{}: {err}", path.display()))
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ClassifiedError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| config_io(path, &e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ClassifiedError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ClassifiedError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| config_io(path, &e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ClassifiedError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid() -> Config {
        Config {
            source_dir: PathBuf::from("/data/sheets"),
            ..Config::default()
        }
    }

    #[test]
    fn default_with_source_dir_is_valid() {
        valid().validate().expect("valid");
    }

    #[test]
    fn missing_source_dir_is_missing_key() {
        let err = Config::default().validate().expect_err("source_dir required");
        assert_eq!(err.code, ErrorCode::MissingKey);
        assert!(err.is_critical());
    }

    #[test]
    fn shutdown_deadline_must_stay_under_forced_kill_limit() {
        let config = Config {
            shutdown_deadline_secs: FORCED_KILL_LIMIT_SECS,
            ..valid()
        };
        let err = config.validate().expect_err("deadline too long");
        assert_eq!(err.code, ErrorCode::InvalidValue);
        assert!(err.message.contains("shutdown_deadline_secs"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = Config {
            max_concurrency: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn poll_interval_longer_than_wait_rejected() {
        let config = Config {
            lock_poll_interval_ms: 5_000,
            lock_max_wait_ms: 1_000,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_resolve_under_home() {
        let home = TempDir::new().expect("home");
        let config = valid();
        assert!(config
            .store_path_or_default(home.path())
            .ends_with(".slotsync/store.json"));
        assert!(config
            .audit_dir_or_default(home.path())
            .ends_with(".slotsync/audit"));
    }

    #[test]
    fn config_file_written_with_owner_only_perms() {
        let home = TempDir::new().expect("home");
        save_at(home.path(), &valid()).expect("save");
        let path = config_path_at(home.path());
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
