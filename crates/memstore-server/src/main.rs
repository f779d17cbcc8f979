//! memstored - in-memory file store daemon
//!
//! Usage:
//!   memstored [--config FILE] [--socket PATH] [run]
//!   memstored print-config

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memstore_config::logging::{init_logging, LogLevel};
use memstore_config::Config;
use memstore_server::{install_signal_handlers, Server};

#[derive(Parser)]
#[command(name = "memstored")]
#[command(version, about = "In-memory file store server", long_about = None)]
struct Cli {
    /// Config file (`.toml`, or `key:value` lines otherwise)
    #[arg(short, long, env = "MEMSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the socket path from the config
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start serving (default)
    Run,
    /// Print the effective configuration as TOML and exit
    PrintConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.server.socket_path = socket;
        config.validate().context("Invalid socket path")?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config),
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn run(config: Config) -> Result<()> {
    let server = Server::bind(config)?;
    install_signal_handlers(server.shutdown_handle())?;

    let summary = server.run()?;
    tracing::info!(
        served = summary.served_per_worker.iter().sum::<u64>(),
        "memstored exited cleanly"
    );
    Ok(())
}
