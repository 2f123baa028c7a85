//! Status messages for the terminal.

use kiln_dev::{Mode, ServerConfig};
use owo_colors::OwoColorize;
use std::net::SocketAddr;
use std::sync::OnceLock;

static COLORS: OnceLock<bool> = OnceLock::new();

/// Decide once whether messages are colored.
pub fn init_colors(no_color: bool) {
    let _ = COLORS.set(!no_color && kiln_dev::logger::should_use_colors());
}

fn colors() -> bool {
    *COLORS.get().unwrap_or(&false)
}

/// Print a success message to stderr.
pub fn success(message: &str) {
    if colors() {
        eprintln!("{} {}", "✓".green().bold(), message);
    } else {
        eprintln!("✓ {}", message);
    }
}

/// Print an info message to stderr.
pub fn info(message: &str) {
    if colors() {
        eprintln!("{} {}", "ℹ".blue().bold(), message);
    } else {
        eprintln!("ℹ {}", message);
    }
}

/// Print a warning message to stderr.
pub fn warning(message: &str) {
    if colors() {
        eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
    } else {
        eprintln!("⚠ {}", message);
    }
}

/// Banner shown once the server listens.
pub fn serving_banner(mode: Mode, addr: SocketAddr, config: &ServerConfig) -> String {
    let url = format!("http://{addr}");
    let url = if colors() {
        url.cyan().underline().to_string()
    } else {
        url
    };

    let mut lines = vec![format!("Serving {} from {}", mode, config.root.display())];
    lines.push(format!("  Local:  {url}"));
    if config.live_reload {
        lines.push(format!("  Reload: ws://{addr}{}", config.ws_path));
    }
    lines.join("\n")
}
