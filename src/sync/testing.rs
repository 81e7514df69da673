//! In-memory remote authority for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::client::RemoteAuthority;
use super::error::SyncError;
use super::protocol::{
    artifact_name, ArtifactHandle, ChangePage, ChangePages, RemoteDeletes, SyncCursors,
    UploadBatch, UploadStatus,
};
use crate::db::{Row, Timestamp, Value};

#[derive(Default)]
struct State {
    sync_timestamp: Timestamp,
    user: String,
    deletes: RemoteDeletes,
    uploads: Vec<UploadBatch>,
    verdict: UploadStatus,
    pending_polls: u32,
    polls: u32,
    artifacts: HashMap<String, UploadStatus>,
    cleaned: Vec<String>,
    rows: BTreeMap<String, Vec<Row>>,
    page_size: usize,
    load_calls: u32,
    fail_load: bool,
}

/// Scriptable [`RemoteAuthority`] keeping all state in memory.
///
/// Uploads finish with the configured verdict once `pending_polls` polls
/// came back unfinished. Pulls page through the configured rows by `id`.
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new(sync_timestamp: Timestamp) -> Self {
        Self {
            state: Mutex::new(State {
                sync_timestamp,
                user: "alice".to_string(),
                verdict: UploadStatus {
                    finished: true,
                    ..Default::default()
                },
                page_size: 100,
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_sync_timestamp(&self, ts: Timestamp) {
        self.with(|s| s.sync_timestamp = ts);
    }

    pub fn set_deletes(&self, deletes: RemoteDeletes) {
        self.with(|s| s.deletes = deletes);
    }

    /// Status reported for the next uploads once they finish.
    pub fn set_verdict(&self, verdict: UploadStatus) {
        self.with(|s| s.verdict = verdict);
    }

    pub fn set_pending_polls(&self, polls: u32) {
        self.with(|s| s.pending_polls = polls);
    }

    pub fn set_artifact_status(&self, artifact: &str, status: UploadStatus) {
        self.with(|s| {
            s.artifacts.insert(artifact.to_string(), status);
        });
    }

    pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
        self.with(|s| {
            s.rows.insert(table.to_string(), rows);
        });
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.with(|s| s.page_size = page_size);
    }

    pub fn fail_load(&self, fail: bool) {
        self.with(|s| s.fail_load = fail);
    }

    pub fn uploads(&self) -> Vec<UploadBatch> {
        self.with(|s| s.uploads.clone())
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.with(|s| s.cleaned.clone())
    }

    pub fn load_calls(&self) -> u32 {
        self.with(|s| s.load_calls)
    }

    pub fn polls(&self) -> u32 {
        self.with(|s| s.polls)
    }
}

fn row_id(row: &Row) -> i64 {
    row.get("id").and_then(Value::as_key).unwrap_or_default()
}

#[async_trait::async_trait]
impl RemoteAuthority for FakeRemote {
    async fn sync_timestamp(&self) -> Result<Timestamp, SyncError> {
        Ok(self.with(|s| s.sync_timestamp))
    }

    async fn deletes(
        &self,
        _cursors: &SyncCursors,
        _sync_timestamp: Timestamp,
    ) -> Result<RemoteDeletes, SyncError> {
        Ok(self.with(|s| s.deletes.clone()))
    }

    async fn upload_changes(
        &self,
        changes: &UploadBatch,
        sync_timestamp: Timestamp,
    ) -> Result<ArtifactHandle, SyncError> {
        Ok(self.with(|s| {
            s.uploads.push(changes.clone());
            let artifact = artifact_name(sync_timestamp, &s.user);
            s.artifacts.insert(artifact.clone(), s.verdict.clone());
            s.polls = 0;
            artifact
        }))
    }

    async fn upload_status(&self, artifact: &str) -> Result<UploadStatus, SyncError> {
        Ok(self.with(|s| {
            s.polls += 1;
            if s.polls <= s.pending_polls {
                return UploadStatus::pending();
            }
            s.artifacts.get(artifact).cloned().unwrap_or_default()
        }))
    }

    async fn clean_sync_dir(&self, artifact: &str) -> Result<(), SyncError> {
        self.with(|s| {
            s.artifacts.remove(artifact);
            s.cleaned.push(artifact.to_string());
        });
        Ok(())
    }

    async fn load_changes(
        &self,
        cursors: &SyncCursors,
        _load_until: Timestamp,
    ) -> Result<ChangePages, SyncError> {
        self.with(|s| {
            s.load_calls += 1;
            if s.fail_load {
                return Err(SyncError::Transport("connection reset".to_string()));
            }
            let mut pages = ChangePages::new();
            for (table, cursor) in cursors {
                let Some(rows) = s.rows.get(table) else {
                    continue;
                };
                let mut page: Vec<Row> = rows
                    .iter()
                    .filter(|r| row_id(r) > cursor.max_loaded_id)
                    .cloned()
                    .collect();
                page.sort_by_key(row_id);
                page.truncate(s.page_size);
                let max_loaded_id = page.last().map(row_id);
                let rows = page
                    .into_iter()
                    .map(|mut r| {
                        let id = row_id(&r);
                        r.insert("_sync_info_tbl_ref_".to_string(), Value::Int(id));
                        r.insert(
                            "_sync_info_tbl_last_modified_".to_string(),
                            Value::Int(s.sync_timestamp),
                        );
                        r.insert("_sync_info_tbl_deleted_".to_string(), Value::Bool(false));
                        r
                    })
                    .collect();
                pages.insert(
                    table.clone(),
                    ChangePage {
                        rows,
                        max_loaded_id,
                    },
                );
            }
            Ok(pages)
        })
    }
}
