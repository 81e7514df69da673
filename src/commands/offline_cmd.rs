//! Offline session and replica maintenance commands.

use std::io::{self, Write};

use clap::{Args, Subcommand};

use replica_sync::config::Config;
use replica_sync::db::ReplicaStore;
use replica_sync::sync::SessionTracker;

/// Manage the offline session
#[derive(Debug, Args)]
pub struct OfflineCommand {
    #[command(subcommand)]
    command: OfflineSubcommand,
}

#[derive(Debug, Subcommand)]
enum OfflineSubcommand {
    /// Take ownership of the replica for offline work
    Start,
    /// End the offline session
    End {
        /// End it even with unsynced rows or an unfinished upload
        #[arg(long, short)]
        force: bool,
    },
}

impl OfflineCommand {
    pub async fn run(
        &self,
        store: ReplicaStore,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let sessions = SessionTracker::new(store);
        match &self.command {
            OfflineSubcommand::Start => {
                let user = &config.user.value;
                sessions.start_offline_session(user).await?;
                if sessions.has_offline_rows().await? {
                    sessions.set_has_offline_data(true).await?;
                }
                println!("Offline session started for {}", user);
            }
            OfflineSubcommand::End { force } => {
                if sessions.end_offline_session(*force).await? {
                    println!("Offline session ended.");
                } else {
                    println!("Offline data not synced yet, session kept.");
                    println!("Run 'replica-sync sync' first, or use --force.");
                }
            }
        }
        Ok(())
    }
}

/// Show the offline session and pending local changes
#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, store: ReplicaStore) -> Result<(), Box<dyn std::error::Error>> {
        let sessions = SessionTracker::new(store.clone());

        println!("Offline Session");
        println!("===============");
        println!();
        match sessions.session().await? {
            None => println!("No offline session"),
            Some(session) => {
                println!(
                    "Owner:        {}",
                    session.offline_user.as_deref().unwrap_or("-")
                );
                println!(
                    "Offline data: {}",
                    if session.has_offline_data { "yes" } else { "no" }
                );
                match (session.upload_started, session.upload_start_time) {
                    (true, Some(ts)) => {
                        println!("Upload:       unfinished (started {})", format_ts(ts))
                    }
                    (true, None) => println!("Upload:       unfinished"),
                    (false, _) => println!("Upload:       none pending"),
                }
            }
        }
        println!();

        println!("Pending Changes");
        println!("===============");
        println!();
        let mut conn = store.pool().acquire().await?;
        let mut total = 0;
        for schema in store.tables() {
            let name = schema.table.name();
            let changes = store.local_changes(&mut conn, name).await?;
            let deletes = changes.iter().filter(|c| c.info.deleted).count();
            let inserts = changes
                .iter()
                .filter(|c| !c.info.deleted && c.info.last_modified.is_none())
                .count();
            let updates = changes.len() - deletes - inserts;
            total += changes.len();
            println!(
                "  {:<20} {} inserts, {} updates, {} deletes",
                name, inserts, updates, deletes
            );
        }
        println!();
        if total == 0 {
            println!("Replica is in sync.");
        }
        Ok(())
    }
}

/// Renders a remote timestamp (ms since epoch) in UTC.
fn format_ts(ts: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ts.to_string(),
    }
}

/// Delete all synced rows from the local replica
#[derive(Debug, Args)]
pub struct ClearCommand {
    /// Skip confirmation prompt
    #[arg(long, short)]
    force: bool,
}

impl ClearCommand {
    pub async fn run(&self, store: ReplicaStore) -> Result<(), Box<dyn std::error::Error>> {
        let sessions = SessionTracker::new(store);

        // Confirm unless --force is used
        if !self.force {
            if sessions.has_offline_rows().await? {
                println!("The replica holds changes that were never synced.");
            }
            print!("Delete all local data? [y/N] ");
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Clear cancelled.");
                return Ok(());
            }
        }

        sessions.clear_local_data().await?;
        println!("Local data cleared.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_ts(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
    }
}
