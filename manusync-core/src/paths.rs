//! On-disk state layout.
//!
//! ```text
//! ~/.manusync/
//!   config.yaml            (mode 0600)
//!   events.jsonl           (append-only audit trail)
//!   baselines/<id>.json    (last agreed snapshot per record)
//!   leases/<id>.lease      (cross-process lock leases)
//!   decisions/<id>.json    (editorial decisions not yet applied)
//!   daemon.sock
//! ```

use std::path::{Path, PathBuf};

use crate::types::RecordId;

pub fn manusync_root(home: &Path) -> PathBuf {
    home.join(".manusync")
}

pub fn config_path(home: &Path) -> PathBuf {
    manusync_root(home).join("config.yaml")
}

pub fn events_path(home: &Path) -> PathBuf {
    manusync_root(home).join("events.jsonl")
}

pub fn baselines_dir(home: &Path) -> PathBuf {
    manusync_root(home).join("baselines")
}

pub fn baseline_path(home: &Path, record_id: &RecordId) -> PathBuf {
    baselines_dir(home).join(format!("{}.json", record_id.0))
}

pub fn leases_dir(home: &Path) -> PathBuf {
    manusync_root(home).join("leases")
}

pub fn decisions_dir(home: &Path) -> PathBuf {
    manusync_root(home).join("decisions")
}

pub fn decision_path(home: &Path, record_id: &RecordId) -> PathBuf {
    decisions_dir(home).join(format!("{}.json", record_id.0))
}
