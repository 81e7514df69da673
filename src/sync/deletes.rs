//! Applies remote deletions to the replica.
//!
//! A remote delete never destroys local work: rows that are unsynced or
//! locally modified, and rows referenced by such rows, are turned back
//! into pending inserts instead of being deleted.

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::debug;

use super::client::RemoteAuthority;
use super::error::SyncError;
use super::protocol::{RemoteDeletes, SyncCursors};
use crate::db::{ReplicaStore, RowKey, SyncInfoFilter, TableSchema, Timestamp};

/// Outcome of the delete phase of a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Rows removed from the replica.
    pub applied: usize,
    /// Remote deletes cancelled to protect local changes.
    pub protected: usize,
}

pub struct DeleteReconciler<'a> {
    store: &'a ReplicaStore,
    remote: &'a dyn RemoteAuthority,
}

impl<'a> DeleteReconciler<'a> {
    pub fn new(store: &'a ReplicaStore, remote: &'a dyn RemoteAuthority) -> Self {
        Self { store, remote }
    }

    /// Fetches the remote deletions up to `sync_timestamp` and applies them.
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        cursors: &SyncCursors,
        sync_timestamp: Timestamp,
    ) -> Result<DeleteReport, SyncError> {
        let deletes = self.remote.deletes(cursors, sync_timestamp).await?;
        self.apply_deletes(conn, &deletes, sync_timestamp).await
    }

    pub async fn apply_deletes(
        &self,
        conn: &mut SqliteConnection,
        deletes: &RemoteDeletes,
        sync_timestamp: Timestamp,
    ) -> Result<DeleteReport, SyncError> {
        let mut report = DeleteReport::default();

        for (table, entries) in deletes {
            let Ok(schema) = self.store.schema(table) else {
                debug!(table = %table, "Ignoring deletes for unsynced table");
                continue;
            };
            let mut keys: Vec<RowKey> = entries.iter().map(|d| d.key).collect();
            keys.sort_unstable();
            keys.dedup();
            if keys.is_empty() {
                continue;
            }

            let (safe, protected) = self.guard(conn, schema, keys).await?;
            report.protected += protected;
            if safe.is_empty() {
                continue;
            }

            let name = schema.table.name();
            self.store.delete_rows(conn, name, &safe).await?;
            self.store
                .tombstone(conn, name, &safe, sync_timestamp)
                .await?;
            report.applied += safe.len();
            debug!(table = name, deleted = safe.len(), protected, "Applied remote deletes");
        }

        Ok(report)
    }

    /// Splits delete candidates into keys safe to delete and a count of
    /// keys that were protected and flagged for re-insert.
    async fn guard(
        &self,
        conn: &mut SqliteConnection,
        schema: &TableSchema,
        mut keys: Vec<RowKey>,
    ) -> Result<(Vec<RowKey>, usize), SyncError> {
        let name = schema.table.name();
        let mut protected = 0;

        // Local edits win over remote deletes
        let modified: Vec<RowKey> = self
            .store
            .read_sync_info(conn, name, SyncInfoFilter::Unsynced(&keys))
            .await?
            .into_iter()
            .map(|info| info.key)
            .collect();
        if !modified.is_empty() {
            self.store.mark_for_reinsert(conn, name, &modified).await?;
            keys.retain(|k| !modified.contains(k));
            protected += modified.len();
        }

        // Keep rows that unsynced rows still point at, one foreign key at a time
        for (child, column) in self.store.referencing(&schema.table) {
            if keys.is_empty() {
                break;
            }
            let mut held = self
                .store
                .referencing_unsynced(conn, child.table.name(), column, &keys)
                .await?;
            held.sort_unstable();
            held.dedup();
            if held.is_empty() {
                continue;
            }
            debug!(
                table = name,
                referenced_by = %child.table,
                column,
                count = held.len(),
                "Cancelling deletes of referenced rows"
            );
            keys.retain(|k| held.binary_search(k).is_err());
            self.store.mark_for_reinsert(conn, name, &held).await?;
            protected += held.len();
        }

        Ok((keys, protected))
    }
}
