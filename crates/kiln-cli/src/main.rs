//! Kiln CLI - local development server with live reload.
//!
//! Parses arguments, initializes logging and runs a [`DevServer`] until
//! Ctrl-C or SIGTERM.

mod cli;
mod ui;

use clap::Parser;
use kiln_dev::{DevError, DevServer, Mode, ServerConfig, logger};
use miette::Result;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let no_color = args.no_color || !logger::should_use_colors();
    logger::init_logger(args.verbose, args.quiet, no_color);
    ui::init_colors(no_color);

    let config = build_config(&args).map_err(to_miette)?;
    let server = DevServer::new(config).map_err(to_miette)?;

    if !args.quiet {
        announce(server.clone());
    }

    server
        .start(CancellationToken::new())
        .await
        .map_err(to_miette)?;

    if !args.quiet {
        ui::success("Server stopped");
    }
    Ok(())
}

fn build_config(args: &cli::Cli) -> kiln_dev::Result<ServerConfig> {
    let mut builder = ServerConfig::load(&args.root)?;

    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(host) = &args.host {
        builder = builder.host(host.clone());
    }
    if let Some(mode) = args.mode {
        builder = builder.mode(Mode::from(mode));
    }
    if args.no_reload {
        builder = builder.live_reload(false);
    }
    if let Some(ws_path) = &args.ws_path {
        builder = builder.ws_path(ws_path.clone());
    }
    if !args.command.is_empty() {
        builder = builder.app_command(args.command.iter().cloned());
    }

    builder.build()
}

/// Print the banner once the server listens.
fn announce(server: DevServer) {
    tokio::spawn(async move {
        let Some(addr) = server.serving().await else {
            return;
        };
        if let Some(mode) = server.mode() {
            ui::info(&ui::serving_banner(mode, addr, server.config()));
        }
        if server.mode() == Some(Mode::App) && server.app_port().is_none() {
            ui::warning("The application could not be started; see the error page in the browser");
        }
    });
}

fn to_miette(err: DevError) -> miette::Report {
    miette::miette!("{}", err)
}
