//! Sync CLI commands for synchronizing with the server.

use std::sync::Arc;

use clap::{Args, Subcommand};

use replica_sync::config::Config;
use replica_sync::db::ReplicaStore;
use replica_sync::sync::{HttpRemote, RemoteAuthority, RoundReport, SyncEngine, SyncError};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and server status
    Status,
}

impl SyncCommand {
    pub async fn run(&self, store: ReplicaStore, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            None => self.sync(store, config).await,
            Some(SyncSubcommand::Status) => self.status(config).await,
        }
    }

    async fn sync(&self, store: ReplicaStore, config: &Config) -> Result<(), SyncCommandError> {
        let remote = HttpRemote::from_config(&config.sync)?;
        let engine = SyncEngine::new(store, Arc::new(remote), config.sync.engine_options());

        println!("Syncing as {}...", config.user.value);
        println!();

        let report = engine.run_sync_round(&config.user.value).await?;
        print_report(&report);
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let Some(server_url) = config.sync.server_url.as_deref() else {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"https://sync.example.com\"");
            println!();
            println!("Or set environment variable:");
            println!("  REPLICA_SYNC_URL");
            return Ok(());
        };

        println!("Server:        {}", server_url);
        println!(
            "API key:       {}",
            if config.sync.api_key.is_some() {
                "set"
            } else {
                "not set"
            }
        );
        println!(
            "Upload polls:  {} x {}ms",
            config.sync.poll_attempts, config.sync.poll_interval_ms
        );
        println!("Pull bound:    {} pages", config.sync.max_pull_iterations);
        println!();

        print!("Server status: ");
        let remote = HttpRemote::from_config(&config.sync)?;
        match remote.sync_timestamp().await {
            Ok(ts) => println!("✓ connected (server time {})", ts),
            Err(SyncError::Transport(e)) => println!("✗ unreachable ({})", e),
            Err(e) => println!("✗ error: {}", e),
        }

        Ok(())
    }
}

fn print_report(report: &RoundReport) {
    if report.clean_sync {
        println!("  ! previous upload had finished, replica was re-pulled");
    }
    println!(
        "  ✓ deletes   {} applied, {} kept for local changes",
        report.deletes.applied, report.deletes.protected
    );
    println!(
        "  ✓ uploaded  {} inserts, {} updates, {} deletes",
        report.upload.inserts, report.upload.updates, report.upload.deletes
    );
    if report.upload.translations > 0 || report.upload.conflicts > 0 {
        println!(
            "              {} new keys, {} conflicts resolved by server",
            report.upload.translations, report.upload.conflicts
        );
    }
    println!(
        "  ✓ pulled    {} row{} ({} page{})",
        report.pull.rows,
        if report.pull.rows == 1 { "" } else { "s" },
        report.pull.pages,
        if report.pull.pages == 1 { "" } else { "s" }
    );
    println!();
    if report.pull.bound_reached {
        println!("Sync complete, the next sync may load more changes.");
    } else {
        println!("Sync complete.");
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    SyncError(SyncError),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::SyncError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::SyncError(e) => Some(e),
        }
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::SyncError(e)
    }
}
