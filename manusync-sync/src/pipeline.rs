//! Shared orchestrator entrypoint used by CLI and daemon.
//!
//! Wires the file-backed collaborators under one home directory:
//! JSON record directories from the config, baselines, pending editorial
//! decisions, the JSON-lines event log and lease files.

use std::path::Path;
use std::sync::Arc;

use manusync_core::{config, ConfigError, Side, SyncConfig};

use crate::baseline_store::FileBaselineStore;
use crate::decision_store::FileDecisionStore;
use crate::error::SyncError;
use crate::event_store::JsonlEventStore;
use crate::json_store::JsonRecordStore;
use crate::lock::FileLockManager;
use crate::orchestrator::Orchestrator;

/// Load `<home>/.manusync/config.yaml` and build a file-backed orchestrator.
pub fn open_at(home: &Path) -> Result<Orchestrator, SyncError> {
    let config = config::load_at(home)?;
    build_at(home, config)
}

/// Build a file-backed orchestrator from an explicit config.
pub fn build_at(home: &Path, config: SyncConfig) -> Result<Orchestrator, SyncError> {
    let canonical_dir = config
        .canonical_dir
        .clone()
        .ok_or_else(|| ConfigError::Invalid("canonical_dir is not set".to_string()))?;
    let shadow_dir = config
        .shadow_dir
        .clone()
        .ok_or_else(|| ConfigError::Invalid("shadow_dir is not set".to_string()))?;

    Orchestrator::builder()
        .config(config)
        .canonical(Arc::new(JsonRecordStore::new(canonical_dir, Side::Canonical)))
        .shadow(Arc::new(JsonRecordStore::new(shadow_dir, Side::Shadow)))
        .baselines(Arc::new(FileBaselineStore::new(home)))
        .events(Arc::new(JsonlEventStore::new(home)))
        .decisions(Arc::new(FileDecisionStore::new(home)))
        .locks(Arc::new(FileLockManager::new(home)))
        .build()
}
