//! Config load error, atomic-write, and init integration tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use slotsync_core::{config, Config, ErrorCode, ErrorDomain, PartitionKey};
use std::fs;
use std::path::PathBuf;

fn write_config(home: &assert_fs::TempDir, yaml: &str) {
    home.child(".slotsync/config.yaml").write_str(yaml).expect("write config");
}

// ---------------------------------------------------------------------------
// 1. Load errors
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_is_missing_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert_eq!(err.domain, ErrorDomain::Configuration);
    assert_eq!(err.code, ErrorCode::MissingFile);
    assert!(err.is_critical());
    assert!(err.message.contains("config.yaml"), "got: {err}");
    assert!(err.message.contains("slotsync init"));
}

#[test]
fn load_corrupt_yaml_is_invalid_value_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, ": : corrupt : yaml : !!!\n  - broken: [unclosed");
    let err = config::load_at(home.path()).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidValue);
    assert!(err.message.contains("config.yaml"), "got: {err}");
    assert!(!err.retryable);
}

#[test]
fn load_without_source_dir_is_missing_key() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, "max_concurrency: 2\n");
    let err = config::load_at(home.path()).unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingKey);
    assert!(err.message.contains("source_dir"));
}

#[test]
fn load_rejects_reserved_partition_key() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, "source_dir: /data\npartitions:\n  north: 0\n");
    let err = config::load_at(home.path()).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidValue);
    assert!(err.message.contains("reserved key 0"));
}

#[test]
fn partial_yaml_fills_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &home,
        "source_dir: /data/sheets\nmax_concurrency: 8\npartitions:\n  harbor: 7\n",
    );
    let cfg = config::load_at(home.path()).expect("load");
    assert_eq!(cfg.max_concurrency, 8);
    assert_eq!(cfg.max_retries, Config::default().max_retries);
    assert_eq!(cfg.file_prefix, "reservations_");
    let map = cfg.partition_map().expect("map");
    assert_eq!(map.resolve("Harbor"), PartitionKey(7));
    assert_eq!(map.resolve("north"), PartitionKey::UNRESOLVED);
}

// ---------------------------------------------------------------------------
// 2. Atomic writes
// ---------------------------------------------------------------------------

#[test]
fn save_leaves_no_tmp_file_behind() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = Config {
        source_dir: PathBuf::from("/data/sheets"),
        ..Config::default()
    };
    config::save_at(home.path(), &cfg).expect("save");

    home.child(".slotsync/config.yaml").assert(predicate::path::exists());
    home.child(".slotsync/config.yaml.tmp")
        .assert(predicate::path::missing());
}

#[test]
fn save_then_load_preserves_overrides() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = Config {
        source_dir: PathBuf::from("/data/sheets"),
        webhook_url: Some("https://hooks.example.com/T000/B000".into()),
        failure_threshold: 2,
        ..Config::default()
    };
    config::save_at(home.path(), &cfg).expect("save");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, cfg);
}

// ---------------------------------------------------------------------------
// 3. Init
// ---------------------------------------------------------------------------

#[test]
fn init_writes_default_partitions() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = config::init_at(home.path(), PathBuf::from("/data/sheets")).expect("init");
    assert_eq!(cfg.partitions.len(), 3);

    let on_disk = fs::read_to_string(config::config_path_at(home.path())).expect("read");
    assert!(on_disk.contains("source_dir: /data/sheets"));
    assert!(on_disk.contains("north: 1"));
}

#[test]
fn init_is_idempotent() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::init_at(home.path(), PathBuf::from("/first")).expect("first init");
    let second = config::init_at(home.path(), PathBuf::from("/second")).expect("second init");
    assert_eq!(second.source_dir, PathBuf::from("/first"));
}
