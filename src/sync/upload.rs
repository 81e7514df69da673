//! Uploads local changes and applies the remote's verdict.
//!
//! The verdict is applied in four steps:
//!
//! 1. Local rows that lost a unique conflict are dropped, freeing their keys.
//! 2. Key translations, highest temporary key first: the row's own key,
//!    its sync info ref and every foreign key pointing at it. Rows that
//!    lost a conflict only get their foreign keys rewritten.
//! 3. The server's conflict rows are written at their keys, which no
//!    pending translation occupies any more.
//! 4. Sync info of every uploaded row is marked as acknowledged.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::client::RemoteAuthority;
use super::error::SyncError;
use super::protocol::{
    strip_remote_meta, ArtifactHandle, TableChanges, Translations, UploadBatch, UploadStatus,
};
use super::retry::RetryPolicy;
use crate::db::{row, ReplicaStore, Row, RowKey, SyncInfo, TableSchema, Timestamp, Value};

/// Server keys of conflict rows, per table.
type ConflictKeys = BTreeMap<String, BTreeSet<RowKey>>;

/// Server rows of unique conflicts with their keys, per table.
type ConflictRows = BTreeMap<String, Vec<(RowKey, Row)>>;

/// Outcome of the upload phase of a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub translations: usize,
    pub conflicts: usize,
    /// Server-side job of this upload, `None` when nothing was uploaded.
    pub artifact: Option<ArtifactHandle>,
}

pub struct UploadCoordinator<'a> {
    store: &'a ReplicaStore,
    remote: &'a dyn RemoteAuthority,
    retry: &'a RetryPolicy,
}

impl<'a> UploadCoordinator<'a> {
    pub fn new(
        store: &'a ReplicaStore,
        remote: &'a dyn RemoteAuthority,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            retry,
        }
    }

    /// Uploads every locally modified row and applies the verdict.
    pub async fn upload(
        &self,
        conn: &mut SqliteConnection,
        sync_timestamp: Timestamp,
    ) -> Result<UploadReport, SyncError> {
        let batch = self.collect(conn).await?;
        if batch.is_empty() {
            debug!("No local changes to upload");
            return Ok(UploadReport::default());
        }

        let mut report = UploadReport::default();
        for changes in batch.values() {
            report.inserts += changes.inserts.len();
            report.updates += changes.updates.len();
            report.deletes += changes.deletes.len();
        }

        let artifact = self.remote.upload_changes(&batch, sync_timestamp).await?;
        info!(
            artifact = %artifact,
            inserts = report.inserts,
            updates = report.updates,
            deletes = report.deletes,
            "Uploaded local changes"
        );

        let status = self.await_verdict(&artifact).await?;
        let (translations, conflicts) = self
            .apply_verdict(conn, &batch, &status, sync_timestamp)
            .await?;
        report.translations = translations;
        report.conflicts = conflicts;
        report.artifact = Some(artifact);
        Ok(report)
    }

    /// Collects the pending inserts, updates and deletes of every table.
    pub async fn collect(&self, conn: &mut SqliteConnection) -> Result<UploadBatch, SyncError> {
        let mut batch = UploadBatch::new();
        for schema in self.store.tables() {
            let name = schema.table.name();
            let mut changes = TableChanges::default();
            for change in self.store.local_changes(conn, name).await? {
                if change.info.deleted {
                    changes.deletes.push(row([
                        (schema.pk.as_str(), Value::Int(change.info.key)),
                        ("last_modified", Value::from(change.info.last_modified)),
                    ]));
                } else if let Some(data) = change.row {
                    if change.info.last_modified.is_none() {
                        changes.inserts.push(data);
                    } else {
                        changes.updates.push(data);
                    }
                }
            }
            if !changes.is_empty() {
                batch.insert(name.to_string(), changes);
            }
        }
        Ok(batch)
    }

    /// Polls the artifact until the remote finished processing it.
    async fn await_verdict(&self, artifact: &str) -> Result<UploadStatus, SyncError> {
        let remote = self.remote;
        let status = self
            .retry
            .poll("upload_finished", move || async move {
                let status = remote.upload_status(artifact).await?;
                if !status.finished {
                    debug!(artifact, "Upload not finished yet");
                }
                Ok::<_, SyncError>(status.finished.then_some(status))
            })
            .await?
            .ok_or_else(|| SyncError::UploadTimeout {
                artifact: artifact.to_string(),
                attempts: self.retry.max_attempts,
            })?;

        match status.error {
            Some(error) => Err(SyncError::RemoteRejected(error.message)),
            None => Ok(status),
        }
    }

    /// Applies conflicts, translations and acknowledgements.
    ///
    /// Returns the number of translations and conflict rows applied.
    pub async fn apply_verdict(
        &self,
        conn: &mut SqliteConnection,
        batch: &UploadBatch,
        status: &UploadStatus,
        sync_timestamp: Timestamp,
    ) -> Result<(usize, usize), SyncError> {
        let translations = status.translations();
        let conflicts = self.conflict_rows(&status.unique_conflicts);
        let conflict_keys: ConflictKeys = conflicts
            .iter()
            .map(|(table, rows)| (table.clone(), rows.iter().map(|(key, _)| *key).collect()))
            .collect();

        self.drop_losers(conn, &translations, &conflict_keys).await?;
        let translated = self
            .apply_translations(conn, &translations, &conflict_keys)
            .await?;
        let applied = self
            .write_conflict_rows(conn, &conflicts, sync_timestamp)
            .await?;
        self.acknowledge(conn, batch, &translations, sync_timestamp)
            .await?;
        Ok((translated, applied))
    }

    /// Server rows of the conflicts, keyed by their server key.
    fn conflict_rows(&self, unique_conflicts: &BTreeMap<String, Vec<Row>>) -> ConflictRows {
        let mut out = ConflictRows::new();
        for (table, rows) in unique_conflicts {
            let Ok(schema) = self.store.schema(table) else {
                warn!(table = %table, "Ignoring conflicts for unsynced table");
                continue;
            };
            for conflict in rows {
                let conflict = strip_remote_meta(conflict.clone());
                let Some(server_key) = schema.key_of(&conflict) else {
                    warn!(table = %table, "Conflict row without primary key");
                    continue;
                };
                out.entry(table.clone())
                    .or_default()
                    .push((server_key, conflict));
            }
        }
        out
    }

    /// Deletes the local rows translated onto a conflict row's key.
    async fn drop_losers(
        &self,
        conn: &mut SqliteConnection,
        translations: &BTreeMap<String, Translations>,
        conflict_keys: &ConflictKeys,
    ) -> Result<(), SyncError> {
        for (table, keys) in conflict_keys {
            let Some(pairs) = translations.get(table) else {
                continue;
            };
            let name = self.store.schema(table)?.table.name();
            let losers: Vec<RowKey> = pairs
                .iter()
                .filter(|(from, to)| keys.contains(to) && from != to)
                .map(|(from, _)| *from)
                .collect();
            if losers.is_empty() {
                continue;
            }
            self.store.delete_rows(conn, name, &losers).await?;
            self.store.delete_sync_info(conn, name, &losers).await?;
            debug!(table = name, losers = ?losers, "Dropped rows that lost a unique conflict");
        }
        Ok(())
    }

    async fn write_conflict_rows(
        &self,
        conn: &mut SqliteConnection,
        conflicts: &ConflictRows,
        sync_timestamp: Timestamp,
    ) -> Result<usize, SyncError> {
        let mut applied = 0;
        for (table, rows) in conflicts {
            let name = self.store.schema(table)?.table.name();
            for (server_key, conflict) in rows {
                self.store.upsert_row(conn, name, conflict).await?;
                self.store
                    .write_sync_info(conn, name, &[SyncInfo::synced(*server_key, sync_timestamp)])
                    .await?;
                debug!(table = name, key = *server_key, "Applied unique conflict");
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn apply_translations(
        &self,
        conn: &mut SqliteConnection,
        translations: &BTreeMap<String, Translations>,
        conflict_keys: &ConflictKeys,
    ) -> Result<usize, SyncError> {
        let mut applied = 0;

        for (table, pairs) in translations {
            let Ok(schema) = self.store.schema(table) else {
                warn!(table = %table, "Ignoring translations for unsynced table");
                continue;
            };
            let conflicts = conflict_keys.get(table);
            let mut pairs = pairs.clone();
            // Higher temporary keys are newer and must move first
            pairs.sort_unstable_by(|a, b| b.0.cmp(&a.0));

            for (from, to) in pairs {
                if from == to {
                    continue;
                }
                let conflicted = conflicts.is_some_and(|keys| keys.contains(&to));
                if !conflicted {
                    self.translate_row(conn, schema, from, to).await?;
                }
                for (child, column) in self.store.referencing(&schema.table) {
                    self.store
                        .rewrite_foreign_keys(conn, child.table.name(), column, from, to)
                        .await?;
                }
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn translate_row(
        &self,
        conn: &mut SqliteConnection,
        schema: &TableSchema,
        from: RowKey,
        to: RowKey,
    ) -> Result<(), SyncError> {
        let name = schema.table.name();
        let moved = self.store.change_key(conn, name, from, to).await?;
        self.store.rewrite_sync_ref(conn, name, from, to).await?;
        if moved == 0 {
            debug!(table = name, from, to, "Translated key has no local row");
        }
        Ok(())
    }

    /// Marks every uploaded row as acknowledged at `sync_timestamp`.
    async fn acknowledge(
        &self,
        conn: &mut SqliteConnection,
        batch: &UploadBatch,
        translations: &BTreeMap<String, Translations>,
        sync_timestamp: Timestamp,
    ) -> Result<(), SyncError> {
        for (table, changes) in batch {
            let schema = self.store.schema(table)?;
            let translated: BTreeMap<RowKey, RowKey> = translations
                .get(table)
                .map(|pairs| pairs.iter().copied().collect())
                .unwrap_or_default();
            let server_key = |key: RowKey| translated.get(&key).copied().unwrap_or(key);

            let mut infos = Vec::new();
            for data in changes.inserts.iter().chain(&changes.updates) {
                if let Some(key) = schema.key_of(data) {
                    infos.push(SyncInfo::synced(server_key(key), sync_timestamp));
                }
            }
            for data in &changes.deletes {
                if let Some(key) = schema.key_of(data) {
                    infos.push(SyncInfo::tombstone(key, sync_timestamp));
                }
            }
            self.store
                .write_sync_info(conn, schema.table.name(), &infos)
                .await?;
        }
        Ok(())
    }
}
