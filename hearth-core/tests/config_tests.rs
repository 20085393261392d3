//! Config loading: defaults, YAML parsing, environment overrides.

use std::collections::HashMap;
use std::path::PathBuf;

use assert_fs::prelude::*;
use hearth_core::{config, Config, ConfigError};
use predicates::prelude::{predicate, Predicate};

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// 1. Defaults
// ---------------------------------------------------------------------------

#[test]
fn missing_config_file_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, Config::defaults_at(home.path()));
    assert_eq!(loaded.push_uri, config::DEFAULT_PUSH_URI);
    assert!(loaded.upgrade_per_user_key);
    assert!(!loaded.push_disabled);
    assert!(loaded.socket_path().starts_with(home.path()));
}

#[test]
fn empty_config_file_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".hearth/config.yaml").write_str("").expect("write");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, Config::defaults_at(home.path()));
}

// ---------------------------------------------------------------------------
// 2. YAML
// ---------------------------------------------------------------------------

#[test]
fn yaml_keys_override_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".hearth/config.yaml")
        .write_str(
            "push_uri: fmprpc://push.example.org:443\n\
             bg_identifier_disabled: true\n\
             label: test-label\n\
             socket_file: /tmp/custom.sock\n",
        )
        .expect("write");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.push_uri, "fmprpc://push.example.org:443");
    assert!(loaded.bg_identifier_disabled);
    assert_eq!(loaded.label(), "test-label");
    assert_eq!(loaded.socket_path(), PathBuf::from("/tmp/custom.sock"));
    assert_eq!(loaded.home, home.path());
}

#[test]
fn corrupt_yaml_reports_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child(".hearth/config.yaml");
    file.write_str("push_disabled: [unclosed").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(predicate::str::contains("config.yaml").eval(&err.to_string()));
    file.assert(predicate::path::exists());
}

// ---------------------------------------------------------------------------
// 3. Environment overrides
// ---------------------------------------------------------------------------

#[test]
fn env_overrides_apply_after_yaml() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".hearth/config.yaml")
        .write_str("push_disabled: false\n")
        .expect("write");

    let mut loaded = config::load_at(home.path()).expect("load");
    let vars = env(&[
        (config::ENV_PUSH_DISABLED, "1"),
        (config::ENV_UPGRADE_PER_USER_KEY, "no"),
        (config::ENV_RUN_DIR, "/tmp/hearth-env-run"),
    ]);
    loaded
        .apply_env_with(|var| vars.get(var).cloned())
        .expect("apply env");

    assert!(loaded.push_disabled);
    assert!(!loaded.upgrade_per_user_key);
    assert_eq!(
        loaded.socket_path(),
        PathBuf::from("/tmp/hearth-env-run/hearth.sock")
    );
}

#[test]
fn invalid_env_boolean_is_rejected() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut loaded = config::load_at(home.path()).expect("load");
    let vars = env(&[(config::ENV_BG_IDENTIFIER_DISABLED, "sometimes")]);
    let err = loaded
        .apply_env_with(|var| vars.get(var).cloned())
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnv { .. }), "got: {err}");
}
