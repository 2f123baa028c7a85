//! The dev server: composition root and lifecycle.
//!
//! A [`DevServer`] moves through
//! `Created → Detecting → Routing → Serving → ShuttingDown → Stopped`
//! exactly once. Detection and bind failures end startup with an error and
//! no partial server; a mode handler that fails to build is served as an
//! error page instead. Shutdown releases every resource even when one step
//! fails or times out.

use crate::config::ServerConfig;
use crate::error::{ConfigError, DevError, Result, ResultExt, SupervisorError};
use crate::hub::{BroadcastHub, ReloadMessage};
use crate::mode::{COMPONENT_MANIFEST, COMPONENT_TEMPLATE, KIT_MANIFEST, Mode, ModeDetector};
use crate::preview::{ComponentPreview, ErrorHandler, KitPreview, PreviewHandler};
use crate::reload;
use crate::supervisor::ProcessSupervisor;
use crate::watcher::{FileChange, FileWatcher};
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Status endpoint.
pub const STATUS_PATH: &str = "/__kiln/status";

/// Extra time allowed for the supervisor beyond its stop grace period.
const SUPERVISOR_STOP_SLACK: Duration = Duration::from_secs(5);

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerState {
    /// Constructed, `start` not called yet
    Created,
    /// Resolving the project mode
    Detecting,
    /// Building the mode handler and routes
    Routing,
    /// Listening
    Serving,
    /// Releasing resources
    ShuttingDown,
    /// Terminal
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Detecting => "detecting",
            ServerState::Routing => "routing",
            ServerState::Serving => "serving",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the serve loop ended.
enum StopReason {
    Cancelled,
    Signal,
    Failed(String),
}

/// A preview handler that can be rebuilt once its project is fixed.
struct PreviewSlot {
    mode: Mode,
    handler: RwLock<Arc<dyn PreviewHandler>>,
    healthy: AtomicBool,
}

impl PreviewSlot {
    fn current(&self) -> Arc<dyn PreviewHandler> {
        self.handler.read().clone()
    }

    fn retry_if_broken(&self, root: &Path, live_reload: bool) {
        if self.healthy.load(Ordering::Acquire) {
            return;
        }
        if let Ok(handler) = build_preview(self.mode, root, live_reload) {
            *self.handler.write() = handler;
            self.healthy.store(true, Ordering::Release);
            tracing::info!(mode = %self.mode, "preview recovered");
        }
    }
}

#[derive(Clone)]
enum ModeHandler {
    Preview(Arc<PreviewSlot>),
    App(ProcessSupervisor),
}

#[derive(Clone)]
struct RouteState {
    mode: Mode,
    root: Arc<PathBuf>,
    hub: BroadcastHub,
    handler: ModeHandler,
    reload_script: Arc<str>,
}

struct ServerInner {
    config: Arc<ServerConfig>,
    state: watch::Sender<ServerState>,
    started: AtomicBool,
    shutdown: CancellationToken,
    hub: BroadcastHub,
    mode: RwLock<Option<Mode>>,
    local_addr: RwLock<Option<SocketAddr>>,
    supervisor: RwLock<Option<ProcessSupervisor>>,
}

/// Development server. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct DevServer {
    inner: Arc<ServerInner>,
}

impl DevServer {
    /// Create a server for `config`. Nothing runs until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Result<Self> {
        if !config.root.is_dir() {
            return Err(ConfigError::InvalidValue {
                field: "root".to_string(),
                value: config.root.display().to_string(),
                hint: "Must be an existing directory".to_string(),
            }
            .into());
        }

        let hub = BroadcastHub::new(config.hub_settings());
        let (state, _) = watch::channel(ServerState::Created);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                state,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                hub,
                mode: RwLock::new(None),
                local_addr: RwLock::new(None),
                supervisor: RwLock::new(None),
            }),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Resolved mode, once detection finished.
    pub fn mode(&self) -> Option<Mode> {
        *self.inner.mode.read()
    }

    /// Bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// The reload hub.
    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// Port of the supervised application in App Mode.
    pub fn app_port(&self) -> Option<u16> {
        self.inner.supervisor.read().as_ref().and_then(|s| s.port())
    }

    /// The application supervisor in App Mode.
    pub fn supervisor(&self) -> Option<ProcessSupervisor> {
        self.inner.supervisor.read().clone()
    }

    /// Wait until the server listens, returning its address.
    ///
    /// Returns `None` if startup failed or the server stopped first.
    pub async fn serving(&self) -> Option<SocketAddr> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| *s >= ServerState::Serving)
            .await
            .map(|s| *s)
            .ok()?;
        if reached == ServerState::Serving {
            self.local_addr()
        } else {
            None
        }
    }

    /// Run the server until `cancel` fires, [`shutdown`](Self::shutdown) is
    /// called, an OS termination signal arrives or the listener fails.
    ///
    /// Returns after every resource has been released.
    ///
    /// # Errors
    ///
    /// - [`DevError::AlreadyStarted`] on a second call
    /// - detection and configuration errors, before anything is bound
    /// - [`DevError::Bind`] when the address is taken
    /// - [`DevError::Server`] when the listener fails while serving
    /// - [`DevError::Shutdown`] when some resource did not stop in time
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DevError::AlreadyStarted);
        }
        if self.inner.shutdown.is_cancelled() {
            self.set_state(ServerState::Stopped);
            return Err(DevError::Shutdown("server was shut down before it started".to_string()));
        }

        let result = self.run(cancel).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "dev server exited with error");
        }
        self.set_state(ServerState::Stopped);
        result
    }

    /// Request shutdown and wait until the server has stopped. Idempotent and
    /// safe to call from any task.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        if !self.inner.started.load(Ordering::SeqCst) {
            self.inner.hub.close().await;
            self.set_state(ServerState::Stopped);
            return;
        }

        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }

    fn set_state(&self, next: ServerState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = %next, "dev server state");
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.inner.config.clone();

        self.set_state(ServerState::Detecting);
        let mode = resolve_mode(&config)?;
        *self.inner.mode.write() = Some(mode);
        tracing::info!(%mode, root = %config.root.display(), "serving project");

        self.set_state(ServerState::Routing);
        let handler = self.build_mode_handler(mode).await;
        if let ModeHandler::App(supervisor) = &handler {
            *self.inner.supervisor.write() = Some(supervisor.clone());
        }
        if config.live_reload {
            self.inner.hub.start();
        }
        let router = build_router(RouteState {
            mode,
            root: Arc::new(config.root.clone()),
            hub: self.inner.hub.clone(),
            handler: handler.clone(),
            reload_script: reload::reload_client_script(&config.ws_path).into(),
        }, &config);

        let listener = match tokio::net::TcpListener::bind(config.addr()).await {
            Ok(listener) => listener,
            Err(source) => {
                self.abort_startup(&handler).await;
                return Err(DevError::Bind {
                    addr: config.addr(),
                    source,
                });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.abort_startup(&handler).await;
                return Err(e.into());
            }
        };
        let watcher = match self.start_watcher(mode, &handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.abort_startup(&handler).await;
                return Err(e);
            }
        };
        *self.inner.local_addr.write() = Some(local_addr);
        self.set_state(ServerState::Serving);

        if let ModeHandler::App(supervisor) = &handler {
            spawn_ready_report(supervisor.clone(), self.inner.shutdown.clone(), config.app.ready_timeout);
        }

        tracing::info!(url = %format!("http://{local_addr}"), "dev server listening");

        let drain = CancellationToken::new();
        let mut server = tokio::spawn({
            let drain = drain.clone();
            async move {
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(drain.cancelled_owned())
                .await
            }
        });

        let reason = tokio::select! {
            joined = &mut server => match joined {
                Ok(Ok(())) => StopReason::Failed("listener stopped unexpectedly".to_string()),
                Ok(Err(e)) => StopReason::Failed(e.to_string()),
                Err(e) => StopReason::Failed(e.to_string()),
            },
            _ = cancel.cancelled() => StopReason::Cancelled,
            _ = self.inner.shutdown.cancelled() => StopReason::Cancelled,
            _ = termination_signal() => StopReason::Signal,
        };

        self.set_state(ServerState::ShuttingDown);
        match &reason {
            StopReason::Cancelled => tracing::info!("shutting down"),
            StopReason::Signal => tracing::info!("received termination signal, shutting down"),
            StopReason::Failed(e) => tracing::error!(error = %e, "server failed, shutting down"),
        }
        // Anything waiting on the internal token (readiness, restarts) stops too.
        self.inner.shutdown.cancel();

        let mut problems = Vec::new();
        if let Some(watcher) = &watcher {
            watcher.stop();
        }
        self.release(&handler, Some(&mut problems)).await;

        if !server.is_finished() {
            drain.cancel();
            match tokio::time::timeout(config.shutdown_timeout, &mut server).await {
                Ok(_) => {}
                Err(_) => {
                    server.abort();
                    problems.push(format!(
                        "HTTP listener did not drain within {}ms",
                        config.shutdown_timeout.as_millis()
                    ));
                }
            }
        }
        *self.inner.local_addr.write() = None;

        if let StopReason::Failed(e) = reason {
            return Err(DevError::Server(e));
        }
        if !problems.is_empty() {
            return Err(DevError::Shutdown(problems.join("; ")));
        }
        tracing::info!("dev server stopped");
        Ok(())
    }

    async fn abort_startup(&self, handler: &ModeHandler) {
        self.set_state(ServerState::ShuttingDown);
        self.inner.shutdown.cancel();
        self.release(handler, None).await;
    }

    /// Close the hub and stop the application, each step bounded.
    async fn release(&self, handler: &ModeHandler, mut problems: Option<&mut Vec<String>>) {
        let config = &self.inner.config;

        if tokio::time::timeout(config.shutdown_timeout, self.inner.hub.close())
            .await
            .is_err()
        {
            tracing::warn!("reload hub did not close in time");
            if let Some(problems) = problems.as_deref_mut() {
                problems.push("reload hub did not close in time".to_string());
            }
        }

        if let ModeHandler::App(supervisor) = handler {
            let limit = config.app.stop_grace + SUPERVISOR_STOP_SLACK;
            if tokio::time::timeout(limit, supervisor.shutdown()).await.is_err() {
                tracing::error!("application did not stop in time");
                if let Some(problems) = problems.as_deref_mut() {
                    problems.push("application did not stop in time".to_string());
                }
            }
        }
    }

    async fn build_mode_handler(&self, mode: Mode) -> ModeHandler {
        let config = &self.inner.config;

        if mode == Mode::App {
            match ProcessSupervisor::new(&config.root, config.app.clone()).await {
                Ok(supervisor) => return ModeHandler::App(supervisor),
                Err(e) => {
                    let err = DevError::ModeInit {
                        mode,
                        message: e.to_string(),
                    };
                    tracing::error!(error = %err, "application mode unavailable");
                    return ModeHandler::Preview(Arc::new(PreviewSlot {
                        mode,
                        handler: RwLock::new(Arc::new(ErrorHandler::new(mode, &err, config.live_reload))),
                        // Supervisors are not rebuilt on change.
                        healthy: AtomicBool::new(true),
                    }));
                }
            }
        }

        let (handler, healthy) = match build_preview(mode, &config.root, config.live_reload) {
            Ok(handler) => (handler, true),
            Err(e) => {
                tracing::error!(error = %e, "preview unavailable");
                let handler: Arc<dyn PreviewHandler> =
                    Arc::new(ErrorHandler::new(mode, &e, config.live_reload));
                (handler, false)
            }
        };
        ModeHandler::Preview(Arc::new(PreviewSlot {
            mode,
            handler: RwLock::new(handler),
            healthy: AtomicBool::new(healthy),
        }))
    }

    fn start_watcher(&self, mode: Mode, handler: &ModeHandler) -> Result<Option<FileWatcher>> {
        let config = self.inner.config.clone();
        if !config.live_reload && mode != Mode::App {
            return Ok(None);
        }

        let hub = self.inner.hub.clone();
        let handler = handler.clone();
        let root = config.root.clone();
        let live_reload = config.live_reload;

        let watcher = FileWatcher::with_handler(
            config.root.clone(),
            config.watcher.poll_interval,
            move |change: FileChange| {
                let path = change.path();
                tracing::debug!(path = %path.display(), "file changed");

                match &handler {
                    ModeHandler::App(supervisor) => supervisor.on_file_change(path),
                    ModeHandler::Preview(slot) => {
                        if is_preview_source(path) {
                            slot.retry_if_broken(&root, live_reload);
                        }
                    }
                }

                if live_reload {
                    let message = ReloadMessage::Reload {
                        path: reload_path(&root, path),
                    };
                    if let Err(e) = hub.notify(&message) {
                        tracing::debug!(error = %e, "reload not delivered");
                    }
                }
            },
        );
        for pattern in &config.watcher.ignore {
            watcher.add_ignore_pattern(pattern);
        }
        watcher.set_debounce(config.watcher.debounce);
        watcher.start().context("failed to start file watcher")?;
        Ok(Some(watcher))
    }
}

impl fmt::Debug for DevServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevServer")
            .field("root", &self.inner.config.root)
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn resolve_mode(config: &ServerConfig) -> Result<Mode> {
    match config.mode {
        Some(mode) => {
            ModeDetector::validate(&config.root, mode)?;
            Ok(mode)
        }
        None if config.auto_detect => ModeDetector::detect(&config.root),
        None => Err(ConfigError::InvalidValue {
            field: "mode".to_string(),
            value: "none".to_string(),
            hint: "Set a mode or enable auto_detect".to_string(),
        }
        .into()),
    }
}

fn build_preview(mode: Mode, root: &Path, live_reload: bool) -> Result<Arc<dyn PreviewHandler>> {
    Ok(match mode {
        Mode::Component => Arc::new(ComponentPreview::new(root, live_reload)?),
        Mode::Kit => Arc::new(KitPreview::new(root, live_reload)?),
        Mode::App => {
            return Err(DevError::ModeInit {
                mode,
                message: "application mode has no preview".to_string(),
            });
        }
    })
}

fn is_preview_source(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| matches!(n, COMPONENT_MANIFEST | COMPONENT_TEMPLATE | KIT_MANIFEST))
}

/// Path reported to browsers: relative to the root with `/` separators,
/// or the full path when it lies outside the root.
pub fn reload_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.display().to_string(),
    }
}

fn spawn_ready_report(supervisor: ProcessSupervisor, cancel: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        match supervisor.wait_until_ready(&cancel, timeout).await {
            Ok(()) | Err(SupervisorError::Cancelled) => {}
            Err(e) => tracing::warn!(
                error = %e,
                "application is not answering yet; the proxy keeps serving the startup page"
            ),
        }
    });
}

fn build_router(state: RouteState, config: &ServerConfig) -> Router {
    let mut router = Router::new().route(STATUS_PATH, get(handle_status));

    if config.live_reload {
        router = router
            .route(&config.ws_path, get(handle_ws))
            .route(reload::RELOAD_SCRIPT_PATH, get(handle_reload_script));
    }
    if state.mode != Mode::App {
        router = router.route("/favicon.ico", get(handle_favicon));
    }

    router
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn handle_ws(State(state): State<RouteState>, upgrade: WebSocketUpgrade) -> Response {
    match state.hub.handle_upgrade(upgrade) {
        Ok(response) => response,
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_reload_script(State(state): State<RouteState>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        state.reload_script.to_string(),
    )
        .into_response()
}

async fn handle_status(State(state): State<RouteState>) -> Json<serde_json::Value> {
    let app = match &state.handler {
        ModeHandler::App(supervisor) => serde_json::json!({
            "port": supervisor.port(),
            "ready": supervisor.is_ready(),
        }),
        ModeHandler::Preview(_) => serde_json::Value::Null,
    };

    Json(serde_json::json!({
        "mode": state.mode,
        "root": state.root.display().to_string(),
        "clients": state.hub.client_count(),
        "app": app,
    }))
}

async fn handle_favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_request(State(state): State<RouteState>, request: Request) -> Response {
    match &state.handler {
        ModeHandler::App(supervisor) => supervisor.serve_http(request).await,
        ModeHandler::Preview(slot) => {
            let handler = slot.current();
            handler.handle(request.uri().path()).await
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn termination_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
