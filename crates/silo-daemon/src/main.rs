//! silod: the silo chunk store daemon.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use silo_config::logging::{init_logging, LogLevel};
use silo_config::Config;

mod server;

#[derive(Parser)]
#[command(name = "silod")]
#[command(version, about = "Silo chunk store daemon", long_about = None)]
struct Cli {
    /// Listen on this socket instead of the configured one
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Info);

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(socket) = cli.socket {
        config.daemon.socket = socket;
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => server::run(config).await?,
    }
    Ok(())
}
