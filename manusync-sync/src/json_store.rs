//! File-backed adapter: one JSON document per record.
//!
//! ```text
//! <dir>/<record_id>.json
//! ```
//!
//! Updates follow the atomic write protocol:
//!
//! 1. Read the current document (missing = revision 0).
//! 2. Compare its revision with the caller's expected revision.
//! 3. Apply the patch and bump the revision.
//! 4. Write to `<id>.json.tmp`.
//! 5. Rename to final path (atomic on POSIX).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use manusync_core::{FieldMap, ManuscriptRecord, RecordId, Side};

use crate::adapter::{apply_patch, AgentStateStore, RecordStore};
use crate::error::{io_err, SyncError};

/// JSON directory store for one side.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
    side: Side,
}

impl JsonRecordStore {
    pub fn new(dir: impl Into<PathBuf>, side: Side) -> Self {
        Self {
            dir: dir.into(),
            side,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<record_id>.json`, refusing ids that would escape the directory.
    pub fn record_path(&self, id: &RecordId) -> Result<PathBuf, SyncError> {
        if !id.is_path_safe() {
            return Err(SyncError::Integrity(format!(
                "record id '{id}' cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{}.json", id.0)))
    }

    async fn load(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        let path = self.record_path(id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.unavailable(&path, err)),
        };
        let record: ManuscriptRecord = serde_json::from_str(&contents)?;
        if record.id != *id {
            return Err(SyncError::Integrity(format!(
                "{} holds record '{}', expected '{id}'",
                path.display(),
                record.id
            )));
        }
        Ok(Some(record))
    }

    async fn store(
        &self,
        id: &RecordId,
        patch: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        let path = self.record_path(id)?;
        let mut record = self
            .load(id)
            .await?
            .unwrap_or_else(|| ManuscriptRecord::empty(id.clone(), self.side));
        if record.revision != expected_revision {
            return Err(SyncError::RevisionConflict {
                side: self.side,
                expected: expected_revision,
                actual: record.revision,
            });
        }
        apply_patch(&mut record, patch, self.side, Utc::now());

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;
        let json = serde_json::to_string_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.unavailable(&tmp, e))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.unavailable(&path, err));
        }
        tracing::debug!(
            side = %self.side,
            record_id = %id,
            revision = record.revision,
            "wrote record"
        );
        Ok(record.revision)
    }

    fn unavailable(&self, path: &Path, err: std::io::Error) -> SyncError {
        SyncError::AdapterUnavailable {
            side: self.side,
            reason: format!("{}: {err}", path.display()),
        }
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get_record(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        self.load(id).await
    }

    async fn update_record(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        self.store(id, fields, expected_revision).await
    }
}

#[async_trait]
impl AgentStateStore for JsonRecordStore {
    async fn get_state(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        self.load(id).await
    }

    async fn update_state(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        self.store(id, fields, expected_revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn patch(field: &str, value: serde_json::Value) -> FieldMap {
        let mut p = FieldMap::new();
        p.insert(field.to_string(), value);
        p
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path(), Side::Canonical);
        assert!(store.get_record(&RecordId::from("ms-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_update_bumps_revision() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path(), Side::Shadow);
        let id = RecordId::from("ms-1");

        assert_eq!(store.update_state(&id, &patch("title", json!("A")), 0).await.unwrap(), 1);
        assert_eq!(store.update_state(&id, &patch("title", json!("B")), 1).await.unwrap(), 2);

        let record = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(record.revision, 2);
        assert_eq!(record.value("title"), Some(&json!("B")));
        assert_eq!(record.modified_by, Side::Shadow);
    }

    #[tokio::test]
    async fn stale_revision_is_rejected_and_file_untouched() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path(), Side::Canonical);
        let id = RecordId::from("ms-1");
        store.update_record(&id, &patch("title", json!("A")), 0).await.unwrap();
        let before = std::fs::read(store.record_path(&id).unwrap()).unwrap();

        let err = store
            .update_record(&id, &patch("title", json!("B")), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RevisionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(std::fs::read(store.record_path(&id).unwrap()).unwrap(), before);
    }

    #[tokio::test]
    async fn tmp_file_cleaned_up_after_write() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path(), Side::Canonical);
        let id = RecordId::from("ms-1");
        store.update_record(&id, &patch("title", json!("A")), 0).await.unwrap();
        let tmp = store.record_path(&id).unwrap().with_extension("json.tmp");
        assert!(!tmp.exists(), "tmp file should be removed after atomic rename");
    }

    #[tokio::test]
    async fn unsafe_record_id_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path(), Side::Canonical);
        let err = store.get_record(&RecordId::from("../escape")).await.unwrap_err();
        assert!(err.is_integrity());
    }
}
