//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use kiln_dev::Mode;
use std::path::PathBuf;

/// Kiln - local development server with live reload
#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Local development server with live reload",
    long_about = "Kiln serves the project in ROOT while you edit it.\n\
                  Components and kits are previewed directly; applications are run\n\
                  as a child process behind a reverse proxy and restarted on change.\n\
                  Connected browsers reload whenever a file changes."
)]
pub struct Cli {
    /// Project directory to serve
    #[arg(default_value = ".")]
    pub root: PathBuf,

    /// Port to listen on (0 picks a free one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Serve as this mode instead of detecting one
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Disable live reload
    ///
    /// No WebSocket endpoint is served and no reload script is injected.
    #[arg(long)]
    pub no_reload: bool,

    /// WebSocket endpoint path
    #[arg(long)]
    pub ws_path: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Command that runs the application in App mode
    ///
    /// Defaults to `go run` on the detected entry point.
    /// Example: `kiln . -- go run ./cmd/web`
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Project modes accepted on the command line.
#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum ModeArg {
    /// A single component
    #[value(name = "component")]
    Component,

    /// A collection of components
    #[value(name = "kit")]
    Kit,

    /// A runnable application
    #[value(name = "app")]
    App,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Component => Mode::Component,
            ModeArg::Kit => Mode::Kit,
            ModeArg::App => Mode::App,
        }
    }
}
