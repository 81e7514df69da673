//! Wire types for the remote authority's sync endpoints.
//!
//! Field names use camelCase to match the remote's JSON contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::db::{Row, RowKey, Timestamp, Value};

/// Opaque name of a server-side upload-processing job.
pub type ArtifactHandle = String;

/// Metadata columns the remote adds to pulled rows.
pub const REMOTE_META_COLUMNS: [&str; 3] = [
    "_sync_info_tbl_ref_",
    "_sync_info_tbl_last_modified_",
    "_sync_info_tbl_deleted_",
];

/// Per-table position of the incremental pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Only rows changed after this timestamp. `None` pulls everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_from: Option<Timestamp>,
    /// Only rows with a source id greater than this.
    pub max_loaded_id: RowKey,
}

/// Cursors for every synced table, keyed by table name.
pub type SyncCursors = BTreeMap<String, SyncCursor>;

/// Artifact name for the upload started at `ts` by `user`.
pub fn artifact_name(ts: Timestamp, user: &str) -> ArtifactHandle {
    format!("{}_{}", ts, user)
}

fn de_key<'de, D>(deserializer: D) -> Result<RowKey, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value
        .as_key()
        .ok_or_else(|| serde::de::Error::custom(format!("invalid row key: {:?}", value)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncTimestampResponse {
    pub sync_timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeletesRequest<'a> {
    pub sync_timestamp: Timestamp,
    pub sync_infos: &'a SyncCursors,
}

/// A row the remote reports as deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelete {
    #[serde(rename = "ref", deserialize_with = "de_key")]
    pub key: RowKey,
    #[serde(default)]
    pub last_modified: Option<Value>,
}

impl RemoteDelete {
    pub fn new(key: RowKey) -> Self {
        Self {
            key,
            last_modified: None,
        }
    }
}

/// Remote deletions per table.
pub type RemoteDeletes = BTreeMap<String, Vec<RemoteDelete>>;

#[derive(Debug, Deserialize)]
pub(crate) struct DeletesResponse {
    #[serde(default)]
    pub deletes: RemoteDeletes,
}

/// Local changes of one table, as uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inserts: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<Row>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// The whole multi-table upload of one round.
pub type UploadBatch = BTreeMap<String, TableChanges>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadRequest<'a> {
    pub changes: &'a UploadBatch,
    pub sync_timestamp: Timestamp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    pub sync_dir: ArtifactHandle,
}

/// Error body attached to a finished artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    pub message: String,
}

/// Completion status of an upload artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadStatus {
    pub finished: bool,
    /// Table -> temporary key -> server key. Keys may arrive as strings.
    pub translated_ids: BTreeMap<String, BTreeMap<String, Value>>,
    /// Table -> the server's canonical rows for rejected inserts.
    pub unique_conflicts: BTreeMap<String, Vec<Row>>,
    pub error: Option<RemoteErrorBody>,
}

/// Temporary-to-server key translations of one table.
pub type Translations = Vec<(RowKey, RowKey)>;

impl UploadStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    /// Parsed translations per table. Unparseable entries are dropped.
    pub fn translations(&self) -> BTreeMap<String, Translations> {
        self.translated_ids
            .iter()
            .map(|(table, entries)| {
                let parsed = entries
                    .iter()
                    .filter_map(|(from, to)| Some((from.trim().parse().ok()?, to.as_key()?)))
                    .collect();
                (table.clone(), parsed)
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CleanSyncDirRequest<'a> {
    pub dir_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoadChangesRequest<'a> {
    pub sync_infos: &'a SyncCursors,
    pub load_until: Timestamp,
}

/// One page of remote changes for a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangePage {
    pub rows: Vec<Row>,
    pub max_loaded_id: Option<RowKey>,
}

/// Pages for every table that had changes.
pub type ChangePages = BTreeMap<String, ChangePage>;

/// Removes the remote's bookkeeping columns from a pulled row.
pub fn strip_remote_meta(mut row: Row) -> Row {
    for column in REMOTE_META_COLUMNS {
        row.remove(column);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_serialization() {
        let mut cursors = SyncCursors::new();
        cursors.insert("books".to_string(), SyncCursor::default());
        cursors.insert(
            "reviews".to_string(),
            SyncCursor {
                sync_from: Some(1700),
                max_loaded_id: 12,
            },
        );
        let json = serde_json::to_value(&cursors).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "books": { "maxLoadedId": 0 },
                "reviews": { "syncFrom": 1700, "maxLoadedId": 12 }
            })
        );
    }

    #[test]
    fn test_upload_status_parses_string_translations() {
        let status: UploadStatus = serde_json::from_str(
            r#"{"finished": true, "translatedIds": {"T": {"-7": "104", "3": 12, "x": "1"}}}"#,
        )
        .unwrap();
        assert!(status.finished);
        assert!(status.error.is_none());
        assert!(status.unique_conflicts.is_empty());
        let translations = status.translations();
        let mut t = translations["T"].clone();
        t.sort();
        assert_eq!(t, vec![(-7, 104), (3, 12)]);
    }

    #[test]
    fn test_upload_status_with_error() {
        let status: UploadStatus =
            serde_json::from_str(r#"{"finished": true, "error": {"message": "boom"}}"#).unwrap();
        assert_eq!(status.error.unwrap().message, "boom");
    }

    #[test]
    fn test_remote_delete_accepts_string_ref() {
        let deletes: DeletesResponse = serde_json::from_str(
            r#"{"deletes": {"books": [{"ref": "9", "last_modified": 1000}, {"ref": 4}]}}"#,
        )
        .unwrap();
        let keys: Vec<RowKey> = deletes.deletes["books"].iter().map(|d| d.key).collect();
        assert_eq!(keys, vec![9, 4]);
    }

    #[test]
    fn test_table_changes_omit_empty_buckets() {
        let changes = TableChanges {
            inserts: vec![crate::db::row([("id", 1)])],
            ..Default::default()
        };
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(json, serde_json::json!({ "inserts": [{ "id": 1 }] }));
    }

    #[test]
    fn test_strip_remote_meta() {
        let row = crate::db::row([
            ("id", Value::Int(1)),
            ("_sync_info_tbl_ref_", Value::Int(1)),
            ("_sync_info_tbl_last_modified_", Value::Int(5)),
            ("_sync_info_tbl_deleted_", Value::Bool(false)),
        ]);
        let row = strip_remote_meta(row);
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name(1700, "bob@example.com"), "1700_bob@example.com");
    }
}
