use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod db;
mod engine;
mod geo;
mod models;
mod provider;
mod sync;

use commands::{ConfigCommand, StatusCommand, TrackCommand};
use config::Config;
use db::init_db;

#[derive(Parser)]
#[command(name = "fleettrack")]
#[command(version)]
#[command(about = "Continuous location tracking with offline-first sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Track this device's position and sync with the server
    Track(TrackCommand),

    /// Show queue state, cached entities, and sync status
    Status(StatusCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleettrack=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Track(cmd)) => {
            let pool = init_db(config.database_path.clone()).await?;
            cmd.run(pool, &config).await?;
        }
        Some(Commands::Status(cmd)) => {
            let pool = init_db(config.database_path.clone()).await?;
            cmd.run(pool, &config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
