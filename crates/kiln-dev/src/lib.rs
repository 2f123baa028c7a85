//! kiln-dev - local development server engine.
//!
//! Serves a project under active edit. The project's kind is detected from
//! marker files ([`mode`]); a polling [`watcher`] reports edits, the
//! WebSocket [`hub`] tells connected browsers to reload, and in App Mode a
//! [`supervisor`] runs the application as a child process behind a reverse
//! proxy, restarting it on every relevant change.
//!
//! # Architecture
//!
//! - [`server`] - composition root and lifecycle state machine
//! - [`mode`] - marker-based project classification
//! - [`watcher`] - polling watcher with debounce and ignore rules
//! - [`hub`] - reload broadcast hub and WebSocket client pumps
//! - [`supervisor`] - child process, port allocation and proxy
//! - [`preview`] - Component and Kit mode handlers
//! - [`reload`] - browser reload client and HTML injection
//! - [`config`] - layered configuration
//! - [`error`] - error types
//! - [`logger`] - tracing setup
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_dev::{DevServer, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> kiln_dev::Result<()> {
//! let config = ServerConfig::load(".")?.port(4000).build()?;
//! let server = DevServer::new(config)?;
//! server.start(CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod logger;
pub mod mode;
pub mod preview;
pub mod reload;
pub mod server;
pub mod supervisor;
pub mod watcher;

pub use config::{ServerConfig, ServerConfigBuilder, WatcherSettings};
pub use error::{ConfigError, DevError, Result, ResultExt, SupervisorError};
pub use hub::{BroadcastHub, ClientHandle, ClientId, HubSettings, ReloadMessage};
pub use mode::{Mode, ModeDetector};
pub use preview::PreviewHandler;
pub use server::{DevServer, ServerState};
pub use supervisor::{AppSettings, ProcessSupervisor};
pub use watcher::{FileChange, FileWatcher, IgnoreRules};
