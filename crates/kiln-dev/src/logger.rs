//! Logging setup built on `tracing`.
//!
//! The dev server logs under the `kiln_dev` target; output of the supervised
//! application is re-emitted under the `app` target so both streams can be
//! filtered independently with `RUST_LOG`, e.g.
//! `RUST_LOG=kiln_dev=debug,app=warn`.
//!
//! ```rust,no_run
//! use kiln_dev::logger::init_logger;
//!
//! init_logger(false, false, false);
//! tracing::info!("ready");
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used with `--verbose`.
pub const VERBOSE_FILTER: &str = "kiln=debug,kiln_dev=debug,app=debug";
/// Filter used with `--quiet`.
pub const QUIET_FILTER: &str = "kiln=error,kiln_dev=error,app=error";
/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "kiln=info,kiln_dev=info,app=info";

/// Install the global subscriber.
///
/// Level resolution order: `verbose`, then `quiet`, then `RUST_LOG`, then
/// [`DEFAULT_FILTER`]. Call once, before anything logs. A second call is
/// ignored.
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    init_logger_with_filter(filter, no_color);
}

/// Install the global subscriber with an explicit filter.
pub fn init_logger_with_filter(filter: EnvFilter, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Subscriber for tests: output goes through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln_dev=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Whether colored output should be used on stderr.
///
/// `NO_COLOR` disables colors, `FORCE_COLOR` forces them, otherwise colors
/// follow whether a user is attending stderr.
pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    console::user_attended_stderr()
}
