//! Server configuration.
//!
//! Values are layered with figment. Priority: programmatic builder calls >
//! `KILN_*` environment variables > `kiln.toml` in the project root >
//! defaults. Durations are written in milliseconds (`*_ms` keys); nested
//! tables map to `__` in environment names, e.g.
//! `KILN_WATCHER__POLL_INTERVAL_MS=250`.

use crate::error::{ConfigError, Result};
use crate::hub::HubSettings;
use crate::mode::Mode;
use crate::supervisor::{
    AppSettings, DEFAULT_READY_TIMEOUT, DEFAULT_RESTART_DELAY, DEFAULT_STOP_GRACE,
};
use crate::watcher::{DEFAULT_DEBOUNCE, DEFAULT_POLL_INTERVAL};
use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the project root.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "KILN_";

/// Default listen host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default WebSocket endpoint.
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default bound on graceful HTTP shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// `KILN_` variables that belong to the child application, not to us.
const RESERVED_ENV_KEYS: &[&str] = &["dev", "root"];

/// Serialized shape shared by defaults, `kiln.toml` and the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    host: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<Mode>,
    auto_detect: bool,
    live_reload: bool,
    ws_path: String,
    shutdown_timeout_ms: u64,
    watcher: WatcherLayer,
    app: AppLayer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct WatcherLayer {
    poll_interval_ms: u64,
    debounce_ms: u64,
    ignore: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct AppLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    ready_timeout_ms: u64,
    restart_delay_ms: u64,
    stop_grace_ms: u64,
}

impl Default for ConfigLayer {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            mode: None,
            auto_detect: true,
            live_reload: true,
            ws_path: DEFAULT_WS_PATH.to_string(),
            shutdown_timeout_ms: millis(DEFAULT_SHUTDOWN_TIMEOUT),
            watcher: WatcherLayer::default(),
            app: AppLayer::default(),
        }
    }
}

impl Default for WatcherLayer {
    fn default() -> Self {
        Self {
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            debounce_ms: millis(DEFAULT_DEBOUNCE),
            ignore: Vec::new(),
        }
    }
}

impl Default for AppLayer {
    fn default() -> Self {
        Self {
            command: None,
            ready_timeout_ms: millis(DEFAULT_READY_TIMEOUT),
            restart_delay_ms: millis(DEFAULT_RESTART_DELAY),
            stop_grace_ms: millis(DEFAULT_STOP_GRACE),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// File watcher tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Time between scans
    pub poll_interval: Duration,
    /// Per-path debounce window
    pub debounce: Duration,
    /// Ignore patterns added on top of the defaults
    pub ignore: Vec<String>,
}

/// Resolved, validated configuration for one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port (0 picks a free one)
    pub port: u16,
    /// Canonical project root
    pub root: PathBuf,
    /// Forced mode; detection is skipped when set
    pub mode: Option<Mode>,
    /// Detect the mode when none is forced
    pub auto_detect: bool,
    /// Serve the WebSocket endpoint and push reloads
    pub live_reload: bool,
    /// WebSocket endpoint path
    pub ws_path: String,
    /// Bound on graceful HTTP shutdown
    pub shutdown_timeout: Duration,
    /// File watcher settings
    pub watcher: WatcherSettings,
    /// Application supervision settings
    pub app: AppSettings,
}

impl ServerConfig {
    /// Builder with built-in defaults only.
    pub fn builder(root: impl Into<PathBuf>) -> ServerConfigBuilder {
        ServerConfigBuilder {
            root: root.into(),
            layer: ConfigLayer::default(),
        }
    }

    /// Builder seeded from defaults, `<root>/kiln.toml` and `KILN_*`
    /// environment variables.
    pub fn load(root: impl Into<PathBuf>) -> Result<ServerConfigBuilder> {
        let root = root.into();
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigLayer::default()));

        let config_file = root.join(CONFIG_FILE_NAME);
        if config_file.is_file() {
            tracing::debug!(path = %config_file.display(), "loading config file");
            figment = figment.merge(Toml::file(config_file));
        }

        figment = figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(RESERVED_ENV_KEYS)
                .split("__"),
        );

        let layer: ConfigLayer = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Ok(ServerConfigBuilder { root, layer })
    }

    /// `host:port` string used for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the reload hub.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings::default()
    }
}

/// Programmatic overrides on top of a loaded configuration.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    root: PathBuf,
    layer: ConfigLayer,
}

impl ServerConfigBuilder {
    /// Listen host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.layer.host = host.into();
        self
    }

    /// Listen port; 0 asks the OS for a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.layer.port = port;
        self
    }

    /// Force a mode instead of detecting one.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.layer.mode = Some(mode);
        self
    }

    /// Enable or disable mode detection.
    pub fn auto_detect(mut self, enabled: bool) -> Self {
        self.layer.auto_detect = enabled;
        self
    }

    /// Enable or disable live reload.
    pub fn live_reload(mut self, enabled: bool) -> Self {
        self.layer.live_reload = enabled;
        self
    }

    /// WebSocket endpoint path.
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.layer.ws_path = path.into();
        self
    }

    /// Bound on graceful HTTP shutdown.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.layer.shutdown_timeout_ms = millis(timeout);
        self
    }

    /// Watcher scan interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.layer.watcher.poll_interval_ms = millis(interval);
        self
    }

    /// Watcher debounce window.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.layer.watcher.debounce_ms = millis(window);
        self
    }

    /// Extra ignore pattern.
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.layer.watcher.ignore.push(pattern.into());
        self
    }

    /// Command line used to run the application.
    pub fn app_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layer.app.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Readiness timeout for the application.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.layer.app.ready_timeout_ms = millis(timeout);
        self
    }

    /// Delay between a change and the restart it triggers.
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.layer.app.restart_delay_ms = millis(delay);
        self
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.layer.app.stop_grace_ms = millis(grace);
        self
    }

    /// Validate and resolve.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when the root does not exist, the
    /// WebSocket path is not a plain absolute path outside `/__kiln/`, or a
    /// required duration is zero.
    pub fn build(self) -> Result<ServerConfig> {
        let root = canonical_root(&self.root)?;
        let layer = self.layer;

        validate_ws_path(&layer.ws_path)?;
        if layer.host.trim().is_empty() {
            return Err(invalid("host", &layer.host, "Use an address such as 127.0.0.1"));
        }
        if layer.shutdown_timeout_ms == 0 {
            return Err(invalid("shutdown_timeout_ms", "0", "Must be greater than zero"));
        }
        if layer.watcher.poll_interval_ms == 0 {
            return Err(invalid("watcher.poll_interval_ms", "0", "Must be greater than zero"));
        }
        if layer.app.command.as_ref().is_some_and(|c| c.is_empty()) {
            return Err(invalid("app.command", "[]", "Provide a program and its arguments"));
        }

        Ok(ServerConfig {
            host: layer.host,
            port: layer.port,
            root,
            mode: layer.mode,
            auto_detect: layer.auto_detect,
            live_reload: layer.live_reload,
            ws_path: layer.ws_path,
            shutdown_timeout: Duration::from_millis(layer.shutdown_timeout_ms),
            watcher: WatcherSettings {
                poll_interval: Duration::from_millis(layer.watcher.poll_interval_ms),
                debounce: Duration::from_millis(layer.watcher.debounce_ms),
                ignore: layer.watcher.ignore,
            },
            app: AppSettings {
                command: layer.app.command,
                ready_timeout: Duration::from_millis(layer.app.ready_timeout_ms),
                restart_delay: Duration::from_millis(layer.app.restart_delay_ms),
                stop_grace: Duration::from_millis(layer.app.stop_grace_ms),
                inject_reload_script: layer.live_reload,
            },
        })
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    let canonical = root.canonicalize().map_err(|e| {
        invalid(
            "root",
            &root.display().to_string(),
            &format!("Directory cannot be opened: {}", e),
        )
    })?;
    if !canonical.is_dir() {
        return Err(invalid(
            "root",
            &root.display().to_string(),
            "Must be a directory",
        ));
    }
    Ok(canonical)
}

fn invalid(field: &str, value: &str, hint: &str) -> crate::error::DevError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        hint: hint.to_string(),
    }
    .into()
}

/// Paths the server routes itself.
const RESERVED_PREFIX: &str = "/__kiln/";

fn validate_ws_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(invalid("ws_path", path, "Must start with '/', e.g. /ws"));
    }
    if path == "/" || path == "/favicon.ico" || path.starts_with(RESERVED_PREFIX) {
        return Err(invalid(
            "ws_path",
            path,
            "This path is served by kiln itself; pick another, e.g. /ws",
        ));
    }
    if let Some(c) = path
        .chars()
        .find(|c| matches!(c, '{' | '}' | '*' | ':' | '?' | '#') || c.is_whitespace())
    {
        return Err(invalid(
            "ws_path",
            path,
            &format!("'{c}' is not allowed; use a plain path such as /ws"),
        ));
    }
    Ok(())
}
