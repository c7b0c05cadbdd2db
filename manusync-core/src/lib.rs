//! manusync core library: domain types, configuration, errors.
//!
//! - [`types`]: records, baselines, change sets, conflicts, sync events
//! - [`config`]: [`SyncConfig`] and its YAML load / save / init
//! - [`paths`]: on-disk state layout under `~/.manusync/`
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{FieldPolicy, LockPolicy, RetryPolicy, SyncConfig, Thresholds};
pub use error::ConfigError;
pub use types::{
    Baseline, ChangeSet, Classification, Conflict, Decision, DeltaKind, Escalation, FieldDelta,
    FieldKind, FieldMap, FieldValue, ManuscriptRecord, Precedence, RecordId, Resolution,
    ResolutionRule, Side, SyncEvent, SyncOutcome, SyncPhase,
};
