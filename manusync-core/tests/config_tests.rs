//! Config error-message, persistence, and serde compatibility tests.

use std::fs;

use manusync_core::{
    config,
    paths::{config_path, manusync_root},
    ConfigError, FieldKind, Precedence, SyncConfig,
};
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = TempDir::new().expect("tempdir");
    fs::create_dir_all(manusync_root(home.path())).expect("mkdir");
    fs::write(
        config_path(home.path()),
        b": : corrupt : yaml : !!!\n  - broken: [unclosed",
    )
    .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_wrong_type_yaml_returns_parse_error() {
    let home = TempDir::new().expect("tempdir");
    fs::create_dir_all(manusync_root(home.path())).expect("mkdir");
    fs::write(config_path(home.path()), b"- this is a list, not a mapping\n").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn load_rejects_invalid_thresholds_on_disk() {
    let home = TempDir::new().expect("tempdir");
    fs::create_dir_all(manusync_root(home.path())).expect("mkdir");
    fs::write(
        config_path(home.path()),
        "thresholds: {high: 0.1, low: 0.9}\ndeadline_ms: 1000\nadapter_timeout_ms: 100\nmax_redetections: 1\n",
    )
    .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Hand-written YAML
// ---------------------------------------------------------------------------

#[test]
fn minimal_yaml_fills_defaults() {
    let yaml = "deadline_ms: 1000\nadapter_timeout_ms: 250\nmax_redetections: 2\n";
    let config: SyncConfig = serde_yaml::from_str(yaml).expect("parse");
    assert_eq!(config.deadline_ms, 1000);
    assert_eq!(config.default_precedence, Precedence::NewestWins);
    assert!(config.fields.is_empty(), "field table is opt-in when written by hand");
    config.validate().expect("valid");
}

#[rstest]
#[case("scalar", FieldKind::Scalar)]
#[case("list", FieldKind::List)]
#[case("counter", FieldKind::Counter)]
fn field_kind_parses_from_yaml(#[case] raw: &str, #[case] expected: FieldKind) {
    let yaml = format!(
        "deadline_ms: 1000\nadapter_timeout_ms: 250\nmax_redetections: 2\nfields:\n  reviewers:\n    kind: {raw}\n"
    );
    let config: SyncConfig = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(config.policy_for("reviewers").kind, expected);
    assert!(!config.is_sensitive("reviewers"));
}

#[rstest]
#[case("canonical-wins", Precedence::CanonicalWins)]
#[case("shadow-wins", Precedence::ShadowWins)]
#[case("newest-wins", Precedence::NewestWins)]
#[case("escalate", Precedence::Escalate)]
fn precedence_parses_from_yaml(#[case] raw: &str, #[case] expected: Precedence) {
    let yaml = format!(
        "deadline_ms: 1000\nadapter_timeout_ms: 250\nmax_redetections: 2\ndefault_precedence: {raw}\n"
    );
    let config: SyncConfig = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(config.precedence_for("anything"), expected);
}

// ---------------------------------------------------------------------------
// 3. Permissions
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn saved_config_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let home = TempDir::new().expect("tempdir");
    config::save_at(home.path(), &SyncConfig::default()).expect("save");
    let mode = fs::metadata(config_path(home.path()))
        .expect("stat")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
