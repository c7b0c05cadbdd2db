//! Editorial decisions waiting to be applied.
//!
//! A decision outlives the process that recorded it until a sync commits it.
//! The file-backed store keeps one JSON map (field → decision) per record at
//! `<home>/.manusync/decisions/<record_id>.json`, written with `.tmp` +
//! rename. Changes for one record are made while holding its lease.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use manusync_core::{paths, Decision, RecordId};

use crate::error::{io_err, SyncError};

type FieldDecisions = BTreeMap<String, Decision>;

#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Decisions stored for one record, ordered by field.
    async fn load(&self, record_id: &RecordId) -> Result<Vec<Decision>, SyncError>;
    /// Every stored decision, ordered by record then field.
    async fn load_all(&self) -> Result<Vec<Decision>, SyncError>;
    /// Store `decision`, replacing any earlier one for the same field.
    async fn save(&self, decision: &Decision) -> Result<(), SyncError>;
    async fn remove(&self, record_id: &RecordId, field: &str) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDecisionStore {
    decisions: Mutex<HashMap<RecordId, FieldDecisions>>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.decisions.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DecisionStore for MemoryDecisionStore {
    async fn load(&self, record_id: &RecordId) -> Result<Vec<Decision>, SyncError> {
        Ok(self
            .decisions
            .lock()
            .get(record_id)
            .map(|fields| fields.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_all(&self) -> Result<Vec<Decision>, SyncError> {
        let decisions = self.decisions.lock();
        let mut all: Vec<Decision> = decisions.values().flat_map(|m| m.values().cloned()).collect();
        all.sort_by(|a, b| (&a.record_id, &a.field).cmp(&(&b.record_id, &b.field)));
        Ok(all)
    }

    async fn save(&self, decision: &Decision) -> Result<(), SyncError> {
        self.decisions
            .lock()
            .entry(decision.record_id.clone())
            .or_default()
            .insert(decision.field.clone(), decision.clone());
        Ok(())
    }

    async fn remove(&self, record_id: &RecordId, field: &str) -> Result<(), SyncError> {
        let mut decisions = self.decisions.lock();
        if let Some(fields) = decisions.get_mut(record_id) {
            fields.remove(field);
            if fields.is_empty() {
                decisions.remove(record_id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// Decisions under `<home>/.manusync/decisions/`.
#[derive(Debug, Clone)]
pub struct FileDecisionStore {
    home: PathBuf,
}

impl FileDecisionStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, SyncError> + Send + 'static,
    {
        let home = self.home.clone();
        tokio::task::spawn_blocking(move || op(&home))
            .await
            .map_err(|err| SyncError::Integrity(format!("decision store join error: {err}")))?
    }
}

#[async_trait]
impl DecisionStore for FileDecisionStore {
    async fn load(&self, record_id: &RecordId) -> Result<Vec<Decision>, SyncError> {
        let record_id = record_id.clone();
        self.blocking(move |home| Ok(load_record_at(home, &record_id)?.into_values().collect()))
            .await
    }

    async fn load_all(&self) -> Result<Vec<Decision>, SyncError> {
        self.blocking(load_all_at).await
    }

    async fn save(&self, decision: &Decision) -> Result<(), SyncError> {
        let decision = decision.clone();
        self.blocking(move |home| {
            let mut fields = load_record_at(home, &decision.record_id)?;
            let record_id = decision.record_id.clone();
            fields.insert(decision.field.clone(), decision);
            save_record_at(home, &record_id, &fields)
        })
        .await
    }

    async fn remove(&self, record_id: &RecordId, field: &str) -> Result<(), SyncError> {
        let (record_id, field) = (record_id.clone(), field.to_string());
        self.blocking(move |home| {
            let mut fields = load_record_at(home, &record_id)?;
            if fields.remove(&field).is_none() {
                return Ok(());
            }
            save_record_at(home, &record_id, &fields)
        })
        .await
    }
}

fn store_path_at(home: &Path, record_id: &RecordId) -> Result<PathBuf, SyncError> {
    if !record_id.is_path_safe() {
        return Err(SyncError::Integrity(format!(
            "record id '{record_id}' cannot be used as a file name"
        )));
    }
    Ok(paths::decision_path(home, record_id))
}

fn load_record_at(home: &Path, record_id: &RecordId) -> Result<FieldDecisions, SyncError> {
    let path = store_path_at(home, record_id)?;
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FieldDecisions::new()),
        Err(err) => Err(io_err(&path, err)),
    }
}

/// Write the record's decisions atomically; an empty map removes the file.
fn save_record_at(home: &Path, record_id: &RecordId, fields: &FieldDecisions) -> Result<(), SyncError> {
    let path = store_path_at(home, record_id)?;
    if fields.is_empty() {
        return match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        };
    }
    let dir = paths::decisions_dir(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(fields)?).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

fn load_all_at(home: &Path) -> Result<Vec<Decision>, SyncError> {
    let dir = paths::decisions_dir(home);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(&dir, err)),
    };
    let mut records = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io_err(&dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            records.push(RecordId::from(stem));
        }
    }
    records.sort();

    let mut all = Vec::new();
    for record_id in records {
        let fields = load_record_at(home, &record_id)?;
        if let Some(stray) = fields.values().find(|d| d.record_id != record_id) {
            return Err(SyncError::Integrity(format!(
                "decisions file of '{record_id}' holds a decision for '{}'",
                stray.record_id
            )));
        }
        all.extend(fields.into_values());
    }
    Ok(all)
}
