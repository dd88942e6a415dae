//! wiretap: outbound connection policy and traffic capture diagnostics
//!
//! This is the main entry point for the wiretap binary. It handles CLI argument
//! parsing and logging initialization, then dispatches to the command handler.
//!
//! # Output
//!
//! - **Results** (decisions, captured packets, statistics) go to stdout
//! - **Debug logging** and **audit events** (`wiretap::audit` target) go to
//!   stderr through the tracing subscriber

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use wiretap::{cli::Cli, cli_handler, config::ConfigLoader};

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    let loader = ConfigLoader::new();
    // Only the log level is needed here; the handler reports config errors
    let log_level = loader
        .load(cli.config.as_deref())
        .map(|config| config.general.log_level)
        .unwrap_or_default();

    init_tracing(cli.verbose, &log_level)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    cli_handler::handle_command(cli.command, &loader, cli.config.as_deref())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured `log_level`, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, log_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let fallback = if log_level.is_empty() { "warn" } else { log_level };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
