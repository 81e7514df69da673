use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ClearCommand, ConfigCommand, OfflineCommand, StatusCommand, SyncCommand};
use replica_sync::config::Config;
use replica_sync::db::{init_db, ReplicaStore};

#[derive(Parser)]
#[command(name = "replica-sync")]
#[command(version)]
#[command(about = "Offline-first sync of a local SQLite replica", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync round against the remote server
    Sync(SyncCommand),

    /// Show the offline session and pending changes
    Status(StatusCommand),

    /// Start or end an offline session
    Offline(OfflineCommand),

    /// Delete all synced data from the local replica
    Clear(ClearCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replica_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Sync(cmd)) => {
            let store = open_replica(&config).await?;
            cmd.run(store, &config).await?;
        }
        Some(Commands::Status(cmd)) => {
            let store = open_replica(&config).await?;
            cmd.run(store).await?;
        }
        Some(Commands::Offline(cmd)) => {
            let store = open_replica(&config).await?;
            cmd.run(store, &config).await?;
        }
        Some(Commands::Clear(cmd)) => {
            let store = open_replica(&config).await?;
            cmd.run(store).await?;
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

async fn open_replica(config: &Config) -> Result<ReplicaStore, Box<dyn std::error::Error>> {
    if config.synced_tables.value.is_empty() {
        return Err("No synced tables configured. Add synced_tables to config.".into());
    }
    let pool = init_db(&config.database_path.value).await?;
    let store = ReplicaStore::open(pool, &config.synced_tables.value).await?;
    Ok(store)
}
