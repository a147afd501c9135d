//! ca-gateway: Calendar Alarm Gateway Main Binary
//!
//! Syncs calendar events periodically and shows alerts ten minutes before
//! and at the start of each event.
//!
//! Usage:
//!   ca-gateway           - Start daemon mode
//!   ca-gateway --sync    - Run one sync cycle and exit
//!   ca-gateway --cli     - Start interactive CLI mode
//!   ca-gateway --help    - Show help

mod app;
mod cli;
mod renderer;

use app::Gateway;
use ca_core::Config;
use ca_schedule::CycleOutcome;
use renderer::ConsoleRenderer;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Background scheduler until Ctrl+C
    Daemon,
    /// One foreground sync cycle
    Sync,
    /// Interactive CLI mode
    Cli,
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args(std::env::args().skip(1));

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("ca-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Keep the REPL readable unless RUST_LOG asks for more
    let default_level = if mode == RunMode::Cli { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing::info!("Starting ca-gateway...");
    tracing::info!("Database: {}", config.store.db_path);

    let gateway = Gateway::build(&config, Arc::new(ConsoleRenderer::new()))?;

    match mode {
        RunMode::Daemon => run_daemon(gateway).await,
        RunMode::Sync => run_once(gateway).await,
        RunMode::Cli => {
            gateway.start()?;
            gateway.request_sync()?;
            let result = cli::run_cli(&gateway).await;
            gateway.shutdown();
            result
        }
        RunMode::Help | RunMode::Version => Ok(()),
    }
}

/// Parse command line arguments
fn parse_args(args: impl Iterator<Item = String>) -> RunMode {
    for arg in args {
        match arg.as_str() {
            "--sync" | "-s" => return RunMode::Sync,
            "--cli" | "-c" => return RunMode::Cli,
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            _ => {}
        }
    }

    RunMode::Daemon
}

/// Print help message
fn print_help() {
    println!("ca-gateway - Calendar Alarm Gateway");
    println!();
    println!("Usage:");
    println!("  ca-gateway           Start daemon mode");
    println!("  ca-gateway --sync    Run one sync cycle and exit");
    println!("  ca-gateway --cli     Start interactive CLI mode");
    println!("  ca-gateway --help    Show this help message");
    println!("  ca-gateway --version Show version");
    println!();
    println!("Environment Variables:");
    println!("  CA_DB_PATH           SQLite database (default: data/ca-gateway.db)");
    println!("  CA_SYNC_FREQUENCY    Sync interval in minutes: 15, 30, 60, 180 or 360");
    println!("  CA_CALENDARS         Comma separated calendar ids to read");
    println!("  CA_ICS_DIR           Directory of per-calendar .ics folders (default: calendars)");
    println!("  CALDAV_URL           CalDAV server URL (optional)");
    println!("  CALDAV_USERNAME      CalDAV username");
    println!("  CALDAV_PASSWORD      CalDAV password");
    println!("  CALDAV_CALENDAR      CalDAV calendar id (default: primary)");
    println!();
    println!("Settings can also be placed in ./ca-gateway.toml.");
}

/// Run daemon mode
async fn run_daemon(gateway: Gateway) -> anyhow::Result<()> {
    let restored = gateway.start()?;
    tracing::info!(
        "Restored {} pending tasks, discarded {} overdue",
        restored.restored.len(),
        restored.discarded.len()
    );

    // Timers do not survive a full stop, so every start syncs once
    gateway.request_sync()?;

    tracing::info!("ca-gateway initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    gateway.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run one cycle in the foreground
///
/// Scheduled tasks stay in the database for the next daemon start.
async fn run_once(gateway: Gateway) -> anyhow::Result<()> {
    let report = gateway.orchestrator.run_cycle(&gateway.scheduler).await;
    gateway.shutdown();

    cli::print_report(&report);
    match report.outcome {
        CycleOutcome::Success => Ok(()),
        CycleOutcome::Failed(reason) => Err(anyhow::anyhow!("Sync failed: {}", reason)),
    }
}
