//! Baseline store: the last mutually agreed snapshot of each record.
//!
//! The file-backed store persists one JSON document per record at
//! `<home>/.manusync/baselines/<record_id>.json`.
//! Writes use the atomic `.tmp` + rename pattern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use manusync_core::{paths, Baseline, RecordId};

use crate::error::{io_err, SyncError};

/// Persistence for [`Baseline`]s. Access for one record is serialized by
/// holding that record's lease.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load(&self, record_id: &RecordId) -> Result<Option<Baseline>, SyncError>;
    async fn save(&self, baseline: &Baseline) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBaselineStore {
    baselines: Mutex<HashMap<RecordId, Baseline>>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a baseline, as an operator restoring from a partial backup would.
    pub fn forget(&self, record_id: &RecordId) {
        self.baselines.lock().remove(record_id);
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn load(&self, record_id: &RecordId) -> Result<Option<Baseline>, SyncError> {
        Ok(self.baselines.lock().get(record_id).cloned())
    }

    async fn save(&self, baseline: &Baseline) -> Result<(), SyncError> {
        self.baselines
            .lock()
            .insert(baseline.record_id.clone(), baseline.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// Baselines under `<home>/.manusync/baselines/`.
#[derive(Debug, Clone)]
pub struct FileBaselineStore {
    home: PathBuf,
}

impl FileBaselineStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }
}

#[async_trait]
impl BaselineStore for FileBaselineStore {
    async fn load(&self, record_id: &RecordId) -> Result<Option<Baseline>, SyncError> {
        let home = self.home.clone();
        let record_id = record_id.clone();
        tokio::task::spawn_blocking(move || load_at(&home, &record_id))
            .await
            .map_err(|err| SyncError::Integrity(format!("baseline load join error: {err}")))?
    }

    async fn save(&self, baseline: &Baseline) -> Result<(), SyncError> {
        let home = self.home.clone();
        let baseline = baseline.clone();
        tokio::task::spawn_blocking(move || save_at(&home, &baseline))
            .await
            .map_err(|err| SyncError::Integrity(format!("baseline save join error: {err}")))?
    }
}

/// Path to the baseline JSON for a record, rooted at `home`.
pub fn store_path_at(home: &Path, record_id: &RecordId) -> Result<PathBuf, SyncError> {
    if !record_id.is_path_safe() {
        return Err(SyncError::Integrity(format!(
            "record id '{record_id}' cannot be used as a file name"
        )));
    }
    Ok(paths::baseline_path(home, record_id))
}

/// Load the baseline for `record_id`; `None` if never synced.
pub fn load_at(home: &Path, record_id: &RecordId) -> Result<Option<Baseline>, SyncError> {
    let path = store_path_at(home, record_id)?;
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let baseline: Baseline = serde_json::from_str(&contents)?;
    if baseline.record_id != *record_id {
        return Err(SyncError::Integrity(format!(
            "{} holds the baseline of '{}', expected '{record_id}'",
            path.display(),
            baseline.record_id
        )));
    }
    Ok(Some(baseline))
}

/// Save a baseline atomically.
///
/// Writes to `<path>.tmp` then renames to `<path>`.
pub fn save_at(home: &Path, baseline: &Baseline) -> Result<(), SyncError> {
    let path = store_path_at(home, &baseline.record_id)?;
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid baseline store path"),
        ));
    };

    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(baseline)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn baseline(id: &str) -> Baseline {
        let mut b = Baseline::initial(RecordId::from(id));
        b.fields.insert("status".into(), json!("submitted"));
        b.fields.insert("keywords".into(), json!(["acne"]));
        b.canonical_revision = 4;
        b.shadow_revision = 7;
        b.generation = 2;
        b.synced_at = Utc::now();
        b
    }

    #[test]
    fn none_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(load_at(tmp.path(), &RecordId::from("nonexistent")).unwrap().is_none());
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().unwrap();
        let b = baseline("ms-1");
        save_at(tmp.path(), &b).unwrap();
        let loaded = load_at(tmp.path(), &b.record_id).unwrap().unwrap();
        assert_eq!(loaded, b);
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let tmp = TempDir::new().unwrap();
        let b = baseline("clean_test");
        save_at(tmp.path(), &b).unwrap();
        let tmp_path = store_path_at(tmp.path(), &b.record_id)
            .unwrap()
            .with_extension("json.tmp");
        assert!(
            !tmp_path.exists(),
            "tmp file should be removed after atomic rename"
        );
    }

    #[test]
    fn mismatched_record_id_is_integrity_error() {
        let tmp = TempDir::new().unwrap();
        let b = baseline("ms-1");
        save_at(tmp.path(), &b).unwrap();
        let src = store_path_at(tmp.path(), &b.record_id).unwrap();
        let dst = store_path_at(tmp.path(), &RecordId::from("ms-2")).unwrap();
        std::fs::copy(src, dst).unwrap();

        let err = load_at(tmp.path(), &RecordId::from("ms-2")).unwrap_err();
        assert!(err.is_integrity(), "got: {err}");
    }

    #[tokio::test]
    async fn file_store_trait_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileBaselineStore::new(tmp.path());
        let b = baseline("ms-3");
        store.save(&b).await.unwrap();
        assert_eq!(store.load(&b.record_id).await.unwrap(), Some(b));
    }
}
