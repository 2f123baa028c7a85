//! Application supervision for App Mode.
//!
//! [`ProcessSupervisor`] owns at most one running [`AppProcess`] at a time,
//! behind a single async mutex that serializes start, stop and restart.
//! Inbound HTTP goes through a [`ReverseProxy`] aimed at whatever port the
//! current process was given; each (re)start picks a fresh port.
//!
//! Restarts triggered by file changes are coalesced: a burst of edits inside
//! the restart delay produces one restart.

pub mod port;
pub mod process;
pub mod proxy;

pub use process::{AppProcess, ExitState, LaunchSpec};
pub use proxy::{ReverseProxy, starting_page};

use crate::error::SupervisorError;
use crate::mode::{self, COMMAND_DIR, ENTRY_POINT};
use axum::extract::Request;
use axum::response::Response;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Extensions whose changes make the application restart.
pub const RESTART_EXTENSIONS: &[&str] = &[
    "go", "html", "tmpl", "gohtml", "sql", "yaml", "yml", "json", "toml",
];

/// File names that restart the application regardless of extension.
pub const RESTART_FILE_NAMES: &[&str] = &["go.mod", "go.sum"];

/// Conventional directories searched for an entry point after `cmd/`.
pub const ENTRY_SEARCH_DIRS: &[&str] = &["app", "server"];

/// Default time allowed for the application to answer HTTP.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default delay between a change and the restart it triggers.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(100);
/// Default time between SIGTERM and a forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for the supervised application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    /// Command line overriding the default `go run <entry dir>`
    pub command: Option<Vec<String>>,
    /// How long `wait_until_ready` waits after a restart
    pub ready_timeout: Duration,
    /// Delay coalescing change bursts into one restart
    pub restart_delay: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    /// Inject the reload client into proxied HTML
    pub inject_reload_script: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            command: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            inject_reload_script: true,
        }
    }
}

/// Locate the application's entry point.
///
/// Search order: `main.go` at the root, the single `cmd/<name>/main.go`,
/// then `app/main.go` and `server/main.go`. First match wins.
pub fn locate_entry_point(root: &Path) -> Result<PathBuf, SupervisorError> {
    let root_entry = root.join(ENTRY_POINT);
    if root_entry.is_file() {
        return Ok(root_entry);
    }

    let commands = mode::command_entry_points(root);
    if commands.len() == 1 {
        if let Some(entry) = commands.into_iter().next() {
            return Ok(entry);
        }
    } else if commands.len() > 1 {
        tracing::debug!(
            count = commands.len(),
            "several {}/<name>/{} candidates, skipping",
            COMMAND_DIR,
            ENTRY_POINT
        );
    }

    ENTRY_SEARCH_DIRS
        .iter()
        .map(|dir| root.join(dir).join(ENTRY_POINT))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| SupervisorError::EntryPointNotFound {
            root: root.to_path_buf(),
        })
}

/// Build the launch spec for `entry` under `root`.
pub fn launch_spec(
    root: &Path,
    entry: &Path,
    command: Option<&[String]>,
) -> Result<LaunchSpec, SupervisorError> {
    let (program, args) = match command {
        Some([program, args @ ..]) => (program.clone(), args.to_vec()),
        Some([]) => return Err(SupervisorError::EmptyCommand),
        None => ("go".to_string(), vec!["run".to_string(), package_arg(root, entry)]),
    };

    Ok(LaunchSpec {
        program,
        args,
        cwd: root.to_path_buf(),
        env: vec![
            (process::ENV_DEV_MODE.to_string(), "1".to_string()),
            (process::ENV_DEV_ROOT.to_string(), root.display().to_string()),
        ],
    })
}

fn package_arg(root: &Path, entry: &Path) -> String {
    let dir = entry
        .parent()
        .and_then(|dir| dir.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    if dir.is_empty() {
        ".".to_string()
    } else {
        format!("./{dir}")
    }
}

/// Whether a change to `path` should restart the application.
pub fn is_restart_trigger(path: &Path) -> bool {
    let by_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| RESTART_FILE_NAMES.contains(&n));
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| RESTART_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)));
    by_name || by_extension
}

struct SupervisorInner {
    root: PathBuf,
    entry: PathBuf,
    launch: LaunchSpec,
    settings: AppSettings,
    proxy: ReverseProxy,
    /// The one live process. Only touched with this lock held.
    lifecycle: Mutex<Option<AppProcess>>,
    target: RwLock<Option<SocketAddr>>,
    ready: AtomicBool,
    restart_pending: AtomicBool,
    shut_down: AtomicBool,
    shutdown_token: CancellationToken,
}

/// Runs the application as a child process and proxies HTTP to it.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// Locate the entry point, allocate a port and start the application.
    pub async fn new(root: &Path, settings: AppSettings) -> Result<Self, SupervisorError> {
        let entry = locate_entry_point(root)?;
        let launch = launch_spec(root, &entry, settings.command.as_deref())?;
        let proxy = ReverseProxy::new(settings.inject_reload_script)?;

        tracing::debug!(entry = %entry.display(), command = %launch, "supervising application");

        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                root: root.to_path_buf(),
                entry,
                launch,
                settings,
                proxy,
                lifecycle: Mutex::new(None),
                target: RwLock::new(None),
                ready: AtomicBool::new(false),
                restart_pending: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
            }),
        };
        supervisor.start().await?;
        Ok(supervisor)
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Entry point that was located.
    pub fn entry_point(&self) -> &Path {
        &self.inner.entry
    }

    /// Command used to launch the application.
    pub fn launch(&self) -> &LaunchSpec {
        &self.inner.launch
    }

    /// Settings in effect.
    pub fn settings(&self) -> &AppSettings {
        &self.inner.settings
    }

    /// Port of the current process, if one is running.
    pub fn port(&self) -> Option<u16> {
        self.target().map(|addr| addr.port())
    }

    /// Whether the current process has answered HTTP.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn target(&self) -> Option<SocketAddr> {
        *self.inner.target.read()
    }

    /// Start the application. A no-op while a process is running.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.inner.lifecycle.lock().await;
        if slot.as_ref().is_some_and(|p| !p.has_exited()) {
            return Ok(());
        }
        self.stop_locked(&mut slot).await;
        self.start_locked(&mut slot)
    }

    /// Stop the current process and start a new one on a fresh port.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let mut slot = self.inner.lifecycle.lock().await;
        self.stop_locked(&mut slot).await;
        tracing::info!("restarting application");
        self.start_locked(&mut slot)
    }

    /// Stop the current process, if any.
    pub async fn stop(&self) {
        let mut slot = self.inner.lifecycle.lock().await;
        self.stop_locked(&mut slot).await;
    }

    /// Stop the application for good. Pending restarts are dropped and
    /// later `start`/`restart` calls fail with [`SupervisorError::ShutDown`].
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_token.cancel();
        self.stop().await;
    }

    fn start_locked(&self, slot: &mut Option<AppProcess>) -> Result<(), SupervisorError> {
        if self.is_shut_down() {
            return Err(SupervisorError::ShutDown);
        }

        let port = port::allocate_port()?;
        let process = AppProcess::spawn(&self.inner.launch, port)?;
        *self.inner.target.write() = Some(SocketAddr::from((port::APP_HOST, port)));
        self.inner.ready.store(false, Ordering::SeqCst);
        *slot = Some(process);
        Ok(())
    }

    async fn stop_locked(&self, slot: &mut Option<AppProcess>) {
        *self.inner.target.write() = None;
        self.inner.ready.store(false, Ordering::SeqCst);

        let Some(process) = slot.take() else {
            return;
        };

        // The stop runs on its own task so an abandoned caller cannot leave
        // the child orphaned halfway through the grace period.
        let grace = self.inner.settings.stop_grace;
        let pid = process.pid();
        let stopping = tokio::spawn(process.stop(grace));
        match stopping.await {
            Ok(_) => tracing::debug!(pid, "application stopped"),
            Err(e) => tracing::error!(pid, error = %e, "stop task failed"),
        }
    }

    /// Forward an HTTP request to the application.
    pub async fn serve_http(&self, request: Request) -> Response {
        self.inner.proxy.forward(self.target(), request).await
    }

    /// Whether a change to `path` would restart the application.
    pub fn watches_path(&self, path: &Path) -> bool {
        is_restart_trigger(path)
    }

    /// React to a changed file.
    ///
    /// Relevant changes schedule a restart after the restart delay; changes
    /// arriving while one is pending fold into it. Never blocks.
    pub fn on_file_change(&self, path: &Path) {
        if self.is_shut_down() || !self.watches_path(path) {
            return;
        }
        if self.inner.restart_pending.swap(true, Ordering::SeqCst) {
            tracing::debug!(path = %path.display(), "restart already pending");
            return;
        }

        tracing::debug!(path = %path.display(), "scheduling application restart");
        let supervisor = self.clone();
        tokio::spawn(async move {
            let shutdown = supervisor.inner.shutdown_token.clone();
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(supervisor.inner.settings.restart_delay) => {}
            }
            supervisor.inner.restart_pending.store(false, Ordering::SeqCst);

            match supervisor.restart().await {
                Ok(()) => {
                    let timeout = supervisor.inner.settings.ready_timeout;
                    match supervisor.wait_until_ready(&shutdown, timeout).await {
                        Ok(()) | Err(SupervisorError::Cancelled) => {}
                        Err(e) => tracing::warn!(error = %e, "application not ready after restart"),
                    }
                }
                Err(SupervisorError::ShutDown) => {}
                Err(e) => tracing::error!(error = %e, "failed to restart application"),
            }
        });
    }

    /// Poll the application's root endpoint until it answers.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::ReadyTimeout`] when nothing answers within
    /// `timeout`, [`SupervisorError::Cancelled`] when `cancel` fires or the
    /// supervisor shuts down first.
    pub async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let poll = async {
            let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(target) = self.target() else {
                    continue;
                };
                // A restart may swap the target while we probe.
                if self.inner.proxy.probe(target).await && self.target() == Some(target) {
                    return target;
                }
            }
        };

        tokio::select! {
            target = poll => {
                self.inner.ready.store(true, Ordering::SeqCst);
                tracing::info!(port = target.port(), "application ready");
                Ok(())
            }
            _ = cancel.cancelled() => Err(SupervisorError::Cancelled),
            _ = self.inner.shutdown_token.cancelled() => Err(SupervisorError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(SupervisorError::ReadyTimeout { timeout }),
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("entry", &self.inner.entry)
            .field("port", &self.port())
            .field("ready", &self.is_ready())
            .finish()
    }
}
