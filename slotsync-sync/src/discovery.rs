//! Source-file discovery.
//!
//! A source file is named `<prefix><partition>.<ext>`. Files whose
//! partition name is not in the [`PartitionMap`] are skipped (logged, not an
//! error), as are office owner files (`~$…`) and hidden files.

use std::path::{Path, PathBuf};

use slotsync_core::{ClassifiedError, PartitionKey, PartitionMap};

/// Prefix office suites use for the owner file of an open workbook.
pub const OWNER_FILE_PREFIX: &str = "~$";

/// A discovered source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Partition name taken from the file name, lowercased.
    pub partition_name: String,
    pub partition: PartitionKey,
}

/// File-naming rules.
#[derive(Debug, Clone)]
pub struct NamingRules {
    pub prefix: String,
    pub extensions: Vec<String>,
}

impl NamingRules {
    pub fn new(prefix: impl Into<String>, extensions: &[String]) -> Self {
        Self {
            prefix: prefix.into(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// Partition name encoded in `file_name`, if it follows the convention.
    pub fn partition_name(&self, file_name: &str) -> Option<String> {
        if file_name.starts_with(OWNER_FILE_PREFIX) || file_name.starts_with('.') {
            return None;
        }
        let (stem, ext) = file_name.rsplit_once('.')?;
        if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return None;
        }
        let name = stem.strip_prefix(&self.prefix)?.trim();
        (!name.is_empty()).then(|| name.to_lowercase())
    }
}

/// List source files in `dir`, sorted by path.
pub fn discover(
    dir: &Path,
    rules: &NamingRules,
    partitions: &PartitionMap,
) -> Result<Vec<SourceFile>, ClassifiedError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ClassifiedError::from_source_io(dir, &e).with_retryable(false)
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ClassifiedError::from_source_io(dir, &e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(partition_name) = rules.partition_name(file_name) else {
            tracing::trace!(file = %path.display(), "not a source file");
            continue;
        };
        let partition = partitions.resolve(&partition_name);
        if !partition.is_resolved() {
            tracing::info!(
                file = %path.display(),
                partition = %partition_name,
                "skipping file with unmapped partition name"
            );
            continue;
        }
        files.push(SourceFile {
            path,
            partition_name,
            partition,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Whether an office owner file for `path` exists beside it.
pub fn owner_file_present(path: &Path) -> bool {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return false;
    };
    dir.join(format!("{OWNER_FILE_PREFIX}{name}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotsync_core::ErrorCode;
    use tempfile::TempDir;

    fn rules() -> NamingRules {
        NamingRules::new("reservations_", &["csv".to_string(), "tsv".to_string()])
    }

    fn partitions() -> PartitionMap {
        PartitionMap::new([("north", 1), ("south", 3)]).expect("map")
    }

    #[test]
    fn partition_name_follows_convention() {
        let r = rules();
        assert_eq!(r.partition_name("reservations_north.csv"), Some("north".into()));
        assert_eq!(r.partition_name("reservations_South.TSV"), Some("south".into()));
        assert_eq!(r.partition_name("reservations_.csv"), None);
        assert_eq!(r.partition_name("bookings_north.csv"), None);
        assert_eq!(r.partition_name("reservations_north.xlsx"), None);
        assert_eq!(r.partition_name("~$reservations_north.csv"), None);
        assert_eq!(r.partition_name(".reservations_north.csv"), None);
    }

    #[test]
    fn discover_skips_unmapped_and_owner_files() {
        let dir = TempDir::new().unwrap();
        for name in [
            "reservations_south.csv",
            "reservations_north.csv",
            "reservations_west.csv",
            "~$reservations_north.csv",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("reservations_dir.csv")).unwrap();

        let files = discover(dir.path(), &rules(), &partitions()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.partition_name.as_str()).collect();
        assert_eq!(names, vec!["north", "south"]);
        assert_eq!(files[0].partition, PartitionKey(1));
    }

    #[test]
    fn missing_directory_is_non_retryable_file_missing() {
        let dir = TempDir::new().unwrap();
        let err = discover(&dir.path().join("absent"), &rules(), &partitions()).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileMissing);
        assert!(!err.retryable);
    }

    #[test]
    fn owner_file_detection() {
        let dir = TempDir::new().unwrap();
        let sheet = dir.path().join("reservations_north.csv");
        std::fs::write(&sheet, "").unwrap();
        assert!(!owner_file_present(&sheet));
        std::fs::write(dir.path().join("~$reservations_north.csv"), "owner").unwrap();
        assert!(owner_file_present(&sheet));
    }
}
