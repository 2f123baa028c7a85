//! Integration tests for layered configuration.
//!
//! Priority: builder calls > `KILN_*` environment > `kiln.toml` > defaults.

use kiln_dev::{ConfigError, DevError, Mode, ServerConfig};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Removes the listed variables when dropped, even if the test panics.
struct EnvGuard {
    vars: Vec<&'static str>,
}

impl EnvGuard {
    fn set(pairs: &[(&'static str, &str)]) -> Self {
        for (key, value) in pairs {
            unsafe { std::env::set_var(key, value) };
        }
        Self {
            vars: pairs.iter().map(|(key, _)| *key).collect(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for var in &self.vars {
            unsafe { std::env::remove_var(var) };
        }
    }
}

fn project_with_config(toml: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("kiln.toml"), toml).unwrap();
    temp
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let temp = project_with_config(
        r#"
port = 4000
ws_path = "/livereload"

[watcher]
poll_interval_ms = 250
ignore = ["dist", "*.log"]

[app]
command = ["go", "run", "./cmd/web"]
stop_grace_ms = 1500
"#,
    );

    let config = ServerConfig::load(temp.path()).unwrap().build().unwrap();
    assert_eq!(config.port, 4000);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.ws_path, "/livereload");
    assert_eq!(config.watcher.poll_interval, Duration::from_millis(250));
    assert_eq!(config.watcher.debounce, Duration::from_millis(100));
    assert_eq!(config.watcher.ignore, vec!["dist", "*.log"]);
    assert_eq!(
        config.app.command,
        Some(vec!["go".to_string(), "run".to_string(), "./cmd/web".to_string()])
    );
    assert_eq!(config.app.stop_grace, Duration::from_millis(1500));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let temp = project_with_config("port = 4000\nlive_reload = true\n");
    let _guard = EnvGuard::set(&[
        ("KILN_PORT", "4100"),
        ("KILN_LIVE_RELOAD", "false"),
        ("KILN_MODE", "kit"),
        ("KILN_WATCHER__DEBOUNCE_MS", "40"),
    ]);

    let config = ServerConfig::load(temp.path()).unwrap().build().unwrap();
    assert_eq!(config.port, 4100);
    assert!(!config.live_reload);
    assert!(!config.app.inject_reload_script);
    assert_eq!(config.mode, Some(Mode::Kit));
    assert_eq!(config.watcher.debounce, Duration::from_millis(40));
}

#[test]
#[serial]
fn test_builder_overrides_environment() {
    let temp = project_with_config("port = 4000\n");
    let _guard = EnvGuard::set(&[("KILN_PORT", "4100"), ("KILN_HOST", "0.0.0.0")]);

    let config = ServerConfig::load(temp.path())
        .unwrap()
        .port(4200)
        .build()
        .unwrap();
    assert_eq!(config.port, 4200);
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.addr(), "0.0.0.0:4200");
}

#[test]
#[serial]
fn test_child_environment_variables_are_not_config() {
    let temp = TempDir::new().unwrap();
    let _guard = EnvGuard::set(&[("KILN_DEV", "1"), ("KILN_ROOT", "/somewhere/else")]);

    let config = ServerConfig::load(temp.path()).unwrap().build().unwrap();
    assert_eq!(config.root, temp.path().canonicalize().unwrap());
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let temp = TempDir::new().unwrap();
    let loaded = ServerConfig::load(temp.path()).unwrap().build().unwrap();
    let defaults = ServerConfig::builder(temp.path()).build().unwrap();
    assert_eq!(loaded, defaults);
}

#[test]
#[serial]
fn test_malformed_file_is_a_load_error() {
    let temp = project_with_config("port = [\n");
    let err = ServerConfig::load(temp.path()).unwrap_err();
    assert!(
        matches!(err, DevError::Config(ConfigError::Load(_))),
        "got {err:?}"
    );
}

#[test]
#[serial]
fn test_invalid_values_are_rejected_on_build() {
    let temp = project_with_config("ws_path = \"ws\"\n");
    let err = ServerConfig::load(temp.path()).unwrap().build().unwrap_err();
    match err {
        DevError::Config(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "ws_path"),
        other => panic!("expected InvalidValue, got {other:?}"),
    }

    let temp = project_with_config("[app]\ncommand = []\n");
    assert!(ServerConfig::load(temp.path()).unwrap().build().is_err());
}
