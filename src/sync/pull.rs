//! Incremental download of remote changes.

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use super::client::RemoteAuthority;
use super::error::SyncError;
use super::protocol::{strip_remote_meta, SyncCursor, SyncCursors};
use crate::db::{ReplicaStore, Row, SyncInfo, TableSchema, Timestamp};

/// Default bound on `load_changes` requests per round.
pub const DEFAULT_MAX_PULL_ITERATIONS: u32 = 200;

/// Outcome of the pull phase of a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub rows: usize,
    pub pages: u32,
    /// The last request allowed by the iteration bound still returned rows,
    /// so the remote was not confirmed caught up. The next round's first
    /// request settles it.
    pub bound_reached: bool,
}

/// Builds the pull cursor of every synced table from its sync info.
pub async fn prepare_cursors(
    store: &ReplicaStore,
    conn: &mut SqliteConnection,
) -> Result<SyncCursors, SyncError> {
    let mut cursors = SyncCursors::new();
    for schema in store.tables() {
        let name = schema.table.name();
        let sync_from = store.max_last_modified(conn, name).await?;
        cursors.insert(
            name.to_string(),
            SyncCursor {
                sync_from,
                max_loaded_id: 0,
            },
        );
    }
    Ok(cursors)
}

pub struct DownloadPuller<'a> {
    store: &'a ReplicaStore,
    remote: &'a dyn RemoteAuthority,
    max_iterations: u32,
}

impl<'a> DownloadPuller<'a> {
    pub fn new(
        store: &'a ReplicaStore,
        remote: &'a dyn RemoteAuthority,
        max_iterations: u32,
    ) -> Self {
        Self {
            store,
            remote,
            max_iterations,
        }
    }

    /// Pulls pages until the remote has nothing newer than the cursors up
    /// to `sync_timestamp`, or the iteration bound is hit.
    pub async fn pull(
        &self,
        conn: &mut SqliteConnection,
        cursors: &mut SyncCursors,
        sync_timestamp: Timestamp,
    ) -> Result<PullReport, SyncError> {
        let mut report = PullReport::default();

        for _ in 0..self.max_iterations {
            let pages = self.remote.load_changes(cursors, sync_timestamp).await?;
            report.pages += 1;

            let mut has_more = false;
            for (table, page) in pages {
                if page.rows.is_empty() {
                    continue;
                }
                let Ok(schema) = self.store.schema(&table) else {
                    warn!(table = %table, "Ignoring rows for unsynced table");
                    continue;
                };
                has_more = true;

                let loaded = self
                    .apply_page(conn, schema, page.rows, sync_timestamp)
                    .await?;
                report.rows += loaded.len();

                let page_max = page
                    .max_loaded_id
                    .or_else(|| loaded.iter().filter_map(|r| schema.key_of(r)).max());
                let cursor = cursors.entry(table).or_default();
                if let Some(max) = page_max {
                    cursor.max_loaded_id = max;
                }
            }

            if !has_more {
                debug!(rows = report.rows, pages = report.pages, "Pull caught up");
                return Ok(report);
            }
        }

        // Only reached when the last page still had rows
        warn!(
            iterations = self.max_iterations,
            rows = report.rows,
            "Pull stopped at iteration bound, remaining changes load next round"
        );
        report.bound_reached = true;
        Ok(report)
    }

    /// Upserts one page of rows and marks them as synced at `sync_timestamp`.
    async fn apply_page(
        &self,
        conn: &mut SqliteConnection,
        schema: &TableSchema,
        rows: Vec<Row>,
        sync_timestamp: Timestamp,
    ) -> Result<Vec<Row>, SyncError> {
        let name = schema.table.name();
        let mut loaded = Vec::with_capacity(rows.len());
        let mut infos = Vec::with_capacity(rows.len());

        for data in rows {
            let data = strip_remote_meta(data);
            let Some(key) = schema.key_of(&data) else {
                warn!(table = name, "Pulled row without primary key");
                continue;
            };
            self.store.upsert_row(conn, name, &data).await?;
            infos.push(SyncInfo::synced(key, sync_timestamp));
            loaded.push(data);
        }

        self.store.write_sync_info(conn, name, &infos).await?;
        debug!(table = name, rows = loaded.len(), "Applied pulled page");
        Ok(loaded)
    }
}
