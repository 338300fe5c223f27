//! Remote-store boundary and the JSON document store that ships with it.
//!
//! [`JsonFileStore`] persists every record in one JSON document at the
//! configured path. Commits use the same `.tmp` + rename pattern as the
//! config writer, so an `apply_changes` call lands completely or not at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotsync_core::{
    ChangeKind, ChangeSet, ClassifiedError, ErrorCode, PartitionKey, PeriodRange, RecordKey,
    SourceRecord,
};

/// Remote data store.
///
/// Implementations must make `apply_changes` atomic per call.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every stored record of `partition` whose period lies in `range`.
    async fn fetch_snapshot(
        &self,
        partition: PartitionKey,
        range: PeriodRange,
    ) -> Result<Vec<SourceRecord>, ClassifiedError>;

    /// Apply all of `changes` or none of them.
    async fn apply_changes(&self, changes: &ChangeSet) -> Result<(), ClassifiedError>;
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub records: Vec<SourceRecord>,
}

/// JSON document store. Commits within this process are serialized by an
/// internal mutex held by the blocking worker, so a caller dropping the
/// `apply_changes` future does not release it mid-commit.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    commit: Arc<Mutex<()>>,
}

static COMMIT_SEQ: AtomicU64 = AtomicU64::new(0);

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            commit: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole document; empty when the file does not exist yet.
    pub async fn load(&self) -> Result<StoreDocument, ClassifiedError> {
        let path = self.path.clone();
        blocking(move || load_document(&path)).await
    }
}

#[async_trait]
impl RemoteStore for JsonFileStore {
    async fn fetch_snapshot(
        &self,
        partition: PartitionKey,
        range: PeriodRange,
    ) -> Result<Vec<SourceRecord>, ClassifiedError> {
        let doc = self.load().await?;
        Ok(doc
            .records
            .into_iter()
            .filter(|r| r.partition == partition && range.contains(r.period))
            .collect())
    }

    async fn apply_changes(&self, changes: &ChangeSet) -> Result<(), ClassifiedError> {
        if changes.is_empty() {
            return Ok(());
        }
        let count = changes.len();
        let path = self.path.clone();
        let changes = changes.clone();
        let commit = Arc::clone(&self.commit);
        blocking(move || {
            let _guard = commit.lock().unwrap_or_else(PoisonError::into_inner);
            let doc = load_document(&path)?;
            let mut state: BTreeMap<RecordKey, SourceRecord> =
                doc.records.into_iter().map(|r| (r.key(), r)).collect();
            apply_to(&mut state, &changes)?;
            save_document(
                &path,
                &StoreDocument {
                    updated_at: Some(Utc::now()),
                    records: state.into_values().collect(),
                },
            )
        })
        .await?;
        tracing::debug!(
            store = %self.path.display(),
            changes = count,
            "store commit"
        );
        Ok(())
    }
}

/// Validate and apply `changes` to `state`. On error `state` may be partly
/// modified and must be discarded.
fn apply_to(
    state: &mut BTreeMap<RecordKey, SourceRecord>,
    changes: &ChangeSet,
) -> Result<(), ClassifiedError> {
    for change in changes {
        let key = change.key;
        if !key.partition.is_resolved() {
            return Err(data_op(format!("refusing change for unresolved key {key}")));
        }
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let exists = state.contains_key(&key);
                if change.kind == ChangeKind::Insert && exists {
                    return Err(data_op(format!("insert conflicts with existing record {key}")));
                }
                if change.kind == ChangeKind::Update && !exists {
                    return Err(data_op(format!("update targets missing record {key}")));
                }
                let slots = change
                    .after
                    .clone()
                    .ok_or_else(|| data_op(format!("{} for {key} has no payload", change.kind)))?;
                state.insert(
                    key,
                    SourceRecord {
                        partition: key.partition,
                        period: key.period,
                        slots,
                    },
                );
            }
            ChangeKind::Delete => {
                if state.remove(&key).is_none() {
                    return Err(data_op(format!("delete targets missing record {key}")));
                }
            }
        }
    }
    Ok(())
}

fn load_document(path: &Path) -> Result<StoreDocument, ClassifiedError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreDocument::default()),
        Err(e) => return Err(store_io(path, &e)),
    };
    serde_json::from_str(&contents).map_err(|e| {
        data_op(format!("store document {} is corrupt: {e}", path.display()))
    })
}

fn save_document(path: &Path, doc: &StoreDocument) -> Result<(), ClassifiedError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| store_io(dir, &e))?;
    }
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| data_op(format!("serialize store document: {e}")))?;
    let tmp = path.with_extension(format!(
        "json.{}-{}.tmp",
        std::process::id(),
        COMMIT_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&tmp, json).map_err(|e| store_io(&tmp, &e))?;
    std::fs::rename(&tmp, path).map_err(|e| store_io(path, &e))?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, ClassifiedError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ClassifiedError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        ClassifiedError::remote_sync(ErrorCode::Io, format!("store worker failed: {e}"))
    })?
}

fn data_op(message: String) -> ClassifiedError {
    ClassifiedError::remote_sync(ErrorCode::DataOperation, message)
}

fn store_io(path: &Path, err: &std::io::Error) -> ClassifiedError {
    ClassifiedError::remote_sync(ErrorCode::Io, format!("{}: {err}", path.display()))
}
