//! Error types for the kiln development server.
//!
//! The hierarchy mirrors how failures are handled at runtime:
//! - **Configuration and detection errors** are fatal at startup
//! - **Mode initialization errors** are rendered into the browser instead of
//!   stopping the server
//! - **Supervisor errors** describe failures around the child application
//! - **Shutdown errors** are reported after every resource has been released
//!
//! Watcher and per-client hub failures never surface here; they are logged
//! and absorbed where they happen.

use crate::mode::Mode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type returned by the dev server.
#[derive(Debug, Error)]
pub enum DevError {
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No marker file matched any known project kind
    #[error("Could not detect a project in {}\n\nHint: add component.yaml, kit.yaml, go.mod or main.go to the directory, or force a mode", .root.display())]
    NotDetected {
        /// Directory that was inspected
        root: PathBuf,
    },

    /// A forced mode does not fit the directory contents
    #[error("{} is not a valid {mode} project: {reason}", .root.display())]
    ModeMismatch {
        /// The mode that was requested
        mode: Mode,
        /// Directory that was inspected
        root: PathBuf,
        /// What is missing
        reason: String,
    },

    /// The mode-specific handler could not be built
    #[error("Failed to initialize {mode} mode: {message}")]
    ModeInit {
        /// Mode whose handler failed
        mode: Mode,
        /// Description of the failure
        message: String,
    },

    /// Application supervision failed
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// The reload hub no longer accepts clients
    #[error("Reload hub is closed")]
    HubClosed,

    /// The reload hub was used before its registry was started
    #[error("Reload hub is not running\n\nHint: call start() on the hub before registering clients")]
    HubNotStarted,

    /// Listening socket could not be bound
    #[error("Failed to bind to {addr}: {source}\n\nHint: is another server already using this port?")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error
    #[error("Server error: {0}")]
    Server(String),

    /// `start` was called more than once on the same instance
    #[error("Server has already been started; construct a new DevServer to run again")]
    AlreadyStarted,

    /// Some resource could not be released gracefully
    #[error("Shutdown did not complete cleanly: {0}")]
    Shutdown(String),

    /// File or directory not found
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// I/O errors from file system operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with custom messages
    #[error("{0}")]
    Custom(String),
}

/// Configuration-specific errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration option
    #[error("Invalid value for '{field}': {value}\n\nHint: {hint}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The invalid value
        value: String,
        /// Helpful hint for correct values
        hint: String,
    },

    /// Layered configuration could not be extracted
    #[error("Failed to load configuration: {0}\n\nHint: check kiln.toml syntax and KILN_* environment variables")]
    Load(String),
}

/// Errors raised while supervising the application process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No entry point exists in any of the searched locations
    #[error("No application entry point found in {}\n\nHint: add main.go at the root or a single cmd/<name>/main.go", .root.display())]
    EntryPointNotFound {
        /// Project root that was searched
        root: PathBuf,
    },

    /// Probing for a free local port failed
    #[error("Failed to allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// The configured command is empty
    #[error("Application command is empty")]
    EmptyCommand,

    /// The child process could not be spawned
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        /// Rendered command line
        command: String,
        /// Spawn failure
        #[source]
        source: std::io::Error,
    },

    /// The application did not answer within the readiness timeout
    #[error("Application did not become ready within {}ms", .timeout.as_millis())]
    ReadyTimeout {
        /// How long we waited
        timeout: Duration,
    },

    /// The proxy's HTTP client could not be built
    #[error("Failed to build proxy client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The wait was cancelled by the caller
    #[error("Waiting for the application was cancelled")]
    Cancelled,

    /// The supervisor has been shut down and cannot start processes
    #[error("Supervisor has been shut down")]
    ShutDown,
}

/// Result type alias using `DevError` as the default error type.
pub type Result<T, E = DevError> = std::result::Result<T, E>;

/// Extension trait for adding context to `Result` types.
pub trait ResultExt<T> {
    /// Turn a `NotFound` I/O error into [`DevError::FileNotFound`] for `path`.
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T>;

    /// Prefix the error with a message.
    fn context(self, msg: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: Into<DevError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T> {
        self.map_err(|e| match e.into() {
            DevError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                DevError::FileNotFound(path.as_ref().to_path_buf())
            }
            other => other,
        })
    }

    fn context(self, msg: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| {
            let err: DevError = e.into();
            DevError::Custom(format!("{}: {}", msg, err))
        })
    }
}
