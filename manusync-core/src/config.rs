//! Sync configuration and its YAML persistence.
//!
//! # API pattern
//!
//! Every function touching disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::{config_path, manusync_root};
use crate::types::{FieldKind, Precedence};

// ---------------------------------------------------------------------------
// 1. Config types
// ---------------------------------------------------------------------------

/// Per-field classification and merge policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldPolicy {
    #[serde(default)]
    pub kind: FieldKind,
    /// Sensitive fields are always escalated when both sides disagree.
    #[serde(default)]
    pub sensitive: bool,
    /// Overrides [`SyncConfig::default_precedence`] for this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<Precedence>,
}

impl FieldPolicy {
    pub fn sensitive() -> Self {
        Self {
            sensitive: true,
            ..Self::default()
        }
    }

    pub fn of_kind(kind: FieldKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

/// Confidence cut-offs used by the conflict classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// At or above: eligible for automatic merge.
    pub high: f64,
    /// Below: always escalated.
    pub low: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { high: 0.8, low: 0.3 }
    }
}

/// Retry queue policy for `failed-retryable` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt before giving up permanently.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows the `failures`-th failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Lease policy used by the orchestrator when taking a record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    pub ttl_ms: u64,
    /// Bounded waits attempted before surfacing `LockTimeout`.
    pub acquire_attempts: u32,
    /// Length of each bounded wait.
    pub acquire_wait_ms: u64,
    /// Backoff between waits, doubled per attempt.
    pub acquire_backoff_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            acquire_attempts: 3,
            acquire_wait_ms: 2_000,
            acquire_backoff_ms: 100,
        }
    }
}

impl LockPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.acquire_backoff_ms
                .saturating_mul(1u64 << attempt.min(16)),
        )
    }
}

/// Adapter calls a commit can make while holding a renewed lease: two
/// writes, a compensating write and the baseline save.
const COMMIT_ADAPTER_CALLS: u64 = 4;

/// Everything the orchestrator needs, threaded in at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory of canonical (CMS) record JSON files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_dir: Option<PathBuf>,
    /// Directory of shadow (agent) record JSON files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_dir: Option<PathBuf>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub default_precedence: Precedence,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldPolicy>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub lock: LockPolicy,
    /// Overall budget for one attempt up to the commit step.
    pub deadline_ms: u64,
    /// Per-call budget for each adapter read or write.
    pub adapter_timeout_ms: u64,
    /// Re-detections allowed per attempt after a revision conflict.
    pub max_redetections: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), FieldPolicy::sensitive());
        fields.insert("decision".to_string(), FieldPolicy::sensitive());
        fields.insert("keywords".to_string(), FieldPolicy::of_kind(FieldKind::List));
        fields.insert(
            "revision_round".to_string(),
            FieldPolicy::of_kind(FieldKind::Counter),
        );
        Self {
            canonical_dir: None,
            shadow_dir: None,
            thresholds: Thresholds::default(),
            default_precedence: Precedence::NewestWins,
            fields,
            retry: RetryPolicy::default(),
            lock: LockPolicy::default(),
            deadline_ms: 30_000,
            adapter_timeout_ms: 5_000,
            max_redetections: 3,
        }
    }
}

impl SyncConfig {
    /// Policy for `field`, falling back to a scalar field with the default
    /// precedence.
    pub fn policy_for(&self, field: &str) -> FieldPolicy {
        self.fields.get(field).cloned().unwrap_or_default()
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|p| p.sensitive)
    }

    /// Effective precedence for `field`.
    pub fn precedence_for(&self, field: &str) -> Precedence {
        self.fields
            .get(field)
            .and_then(|p| p.precedence)
            .unwrap_or(self.default_precedence)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Thresholds { high, low } = self.thresholds;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 <= low <= high <= 1 (low={low}, high={high})"
            )));
        }
        if self.lock.acquire_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lock.acquire_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock.ttl_ms == 0 || self.deadline_ms == 0 || self.adapter_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock.ttl_ms, deadline_ms and adapter_timeout_ms must be non-zero".to_string(),
            ));
        }
        // A commit makes up to four adapter calls after the lease is renewed.
        let commit_budget = self.adapter_timeout_ms.saturating_mul(COMMIT_ADAPTER_CALLS);
        if self.lock.ttl_ms <= commit_budget {
            return Err(ConfigError::Invalid(format!(
                "lock.ttl_ms ({}) must exceed {COMMIT_ADAPTER_CALLS} x adapter_timeout_ms ({commit_budget})",
                self.lock.ttl_ms
            )));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.manusync/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to `<home>/.manusync/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let root = manusync_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Write a default config pointing at the two record directories.
///
/// Idempotent: if a config already exists, loads and returns it unchanged.
pub fn init_at(
    home: &Path,
    canonical_dir: PathBuf,
    shadow_dir: PathBuf,
) -> Result<SyncConfig, ConfigError> {
    if config_path(home).exists() {
        return load_at(home);
    }
    let config = SyncConfig {
        canonical_dir: Some(canonical_dir),
        shadow_dir: Some(shadow_dir),
        ..SyncConfig::default()
    };
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(canonical_dir: PathBuf, shadow_dir: PathBuf) -> Result<SyncConfig, ConfigError> {
    init_at(&home()?, canonical_dir, shadow_dir)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
