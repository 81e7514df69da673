//! Offline session bookkeeping.
//!
//! At most one user owns the offline replica at a time. The session is a
//! JSON value in the replica's `_sync_config` table, so it commits and
//! rolls back together with the data it describes.

use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info, warn};

use super::client::RemoteAuthority;
use super::error::SyncError;
use super::protocol::artifact_name;
use crate::db::{ReplicaStore, Timestamp};

/// Config key of the persisted session.
pub const SESSION_KEY: &str = "last_offline_session";

/// Who owns the offline replica, and whether an upload is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OfflineSession {
    pub offline_user: Option<String>,
    pub has_offline_data: bool,
    pub upload_started: bool,
    pub upload_start_time: Option<Timestamp>,
}

impl OfflineSession {
    pub fn for_user(user: &str) -> Self {
        Self {
            offline_user: Some(user.to_string()),
            ..Default::default()
        }
    }

    /// Another user holds unsynced offline data.
    fn blocks(&self, user: &str) -> bool {
        self.has_offline_data && self.offline_user.as_deref().is_some_and(|owner| owner != user)
    }
}

/// Enforces the single-offline-owner rule on top of the replica.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    store: ReplicaStore,
}

impl SessionTracker {
    pub fn new(store: ReplicaStore) -> Self {
        Self { store }
    }

    pub async fn load(conn: &mut SqliteConnection) -> Result<Option<OfflineSession>, SyncError> {
        match ReplicaStore::get_config(conn, SESSION_KEY).await? {
            Some(json) if json != "null" => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }

    pub async fn save(
        conn: &mut SqliteConnection,
        session: &OfflineSession,
    ) -> Result<(), SyncError> {
        let json = serde_json::to_string(session)?;
        ReplicaStore::set_config(conn, SESSION_KEY, &json).await?;
        Ok(())
    }

    pub async fn clear(conn: &mut SqliteConnection) -> Result<(), SyncError> {
        ReplicaStore::delete_config(conn, SESSION_KEY).await?;
        Ok(())
    }

    /// The current session, if any.
    pub async fn session(&self) -> Result<Option<OfflineSession>, SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        Self::load(&mut conn).await
    }

    /// Makes `user` the owner of the offline replica.
    ///
    /// Fails when another user still has offline data, or when a previous
    /// upload never finished. A previous owner without offline data is
    /// replaced.
    pub async fn start_offline_session(&self, user: &str) -> Result<OfflineSession, SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        let session = match Self::load(&mut conn).await? {
            Some(old) if old.blocks(user) => {
                return Err(SyncError::ConflictingOfflineUser {
                    offline_user: old.offline_user.unwrap_or_default(),
                })
            }
            Some(old) if old.upload_started => return Err(SyncError::UploadNotFinished),
            Some(old) if old.offline_user.as_deref() == Some(user) => old,
            Some(old) => {
                if old.offline_user.is_some() {
                    info!(
                        previous = old.offline_user.as_deref().unwrap_or_default(),
                        user, "Taking over offline session"
                    );
                }
                OfflineSession {
                    offline_user: Some(user.to_string()),
                    ..old
                }
            }
            None => OfflineSession::for_user(user),
        };
        Self::save(&mut conn, &session).await?;
        debug!(user, "Offline session started");
        Ok(session)
    }

    /// Ends the offline session.
    ///
    /// Without `force` the session is only cleared when no upload is
    /// pending and no offline rows remain. Returns whether it was cleared.
    pub async fn end_offline_session(&self, force: bool) -> Result<bool, SyncError> {
        let session = self.session().await?;
        let pending = session.as_ref().is_some_and(|s| s.upload_started);
        if force || (!pending && !self.has_offline_rows().await?) {
            let mut conn = self.store.pool().acquire().await?;
            Self::clear(&mut conn).await?;
            debug!(force, "Offline session ended");
            return Ok(true);
        }
        Ok(false)
    }

    /// Records whether the session owner has written offline data.
    pub async fn set_has_offline_data(&self, has_offline_data: bool) -> Result<(), SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        match Self::load(&mut conn).await? {
            Some(mut session) if session.has_offline_data != has_offline_data => {
                session.has_offline_data = has_offline_data;
                Self::save(&mut conn, &session).await
            }
            Some(_) => Ok(()),
            None if has_offline_data => {
                warn!("No offline session to record offline data on");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Deletes every synced row and its sync info, then records that the
    /// session has no offline data left.
    pub async fn clear_local_data(&self) -> Result<(), SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        conn.close_on_drop();
        ReplicaStore::set_foreign_keys(&mut conn, false).await?;

        let mut tx = conn.begin().await?;
        self.store.clear_all(&mut tx).await?;
        tx.commit().await?;

        ReplicaStore::set_foreign_keys(&mut conn, true).await?;
        drop(conn);
        self.set_has_offline_data(false).await?;
        info!("Cleared local data");
        Ok(())
    }

    /// Whether any synced table holds locally modified rows.
    pub async fn has_offline_rows(&self) -> Result<bool, SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        for schema in self.store.tables() {
            if self
                .store
                .count_offline_rows(&mut conn, schema.table.name())
                .await?
                > 0
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fails when another user owns unsynced offline data.
    pub fn check_sync_allowed(
        session: Option<&OfflineSession>,
        user: &str,
    ) -> Result<(), SyncError> {
        match session {
            Some(session) if session.blocks(user) => Err(SyncError::ConflictingOfflineUser {
                offline_user: session.offline_user.clone().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    /// Flags an upload round as in flight.
    ///
    /// Written outside the round transaction so it survives a rollback.
    pub async fn mark_upload_started(&self, ts: Timestamp) -> Result<(), SyncError> {
        let mut conn = self.store.pool().acquire().await?;
        let mut session = Self::load(&mut conn).await?.unwrap_or_default();
        session.upload_started = true;
        session.upload_start_time = Some(ts);
        Self::save(&mut conn, &session).await
    }

    pub async fn mark_upload_finished(conn: &mut SqliteConnection) -> Result<(), SyncError> {
        if let Some(mut session) = Self::load(conn).await? {
            session.upload_started = false;
            session.upload_start_time = None;
            Self::save(conn, &session).await?;
        }
        Ok(())
    }

    /// Checks the outcome of an upload interrupted by a crash.
    ///
    /// Returns `true` when the remote finished processing it, in which case
    /// the replica must be wiped and re-pulled instead of uploading again.
    /// Otherwise the stale artifact is discarded and the round proceeds
    /// normally.
    pub async fn recover_from_crashed_upload(
        &self,
        session: Option<&OfflineSession>,
        user: &str,
        remote: &dyn RemoteAuthority,
    ) -> Result<bool, SyncError> {
        let Some(session) = session.filter(|s| s.upload_started) else {
            return Ok(false);
        };
        let Some(started) = session.upload_start_time else {
            warn!("Interrupted upload has no start time, skipping recovery");
            return Ok(false);
        };

        let artifact = artifact_name(started, user);
        let status = remote.upload_status(&artifact).await?;
        if status.finished && status.error.is_none() {
            info!(artifact = %artifact, "Interrupted upload finished remotely, forcing clean sync");
            return Ok(true);
        }

        info!(artifact = %artifact, "Discarding interrupted upload");
        if let Err(e) = remote.clean_sync_dir(&artifact).await {
            warn!(artifact = %artifact, error = %e, "Unable to clean sync dir");
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::{replica, seed_synced};
    use crate::db::{row, Value};
    use crate::sync::testing::FakeRemote;
    use crate::sync::UploadStatus;

    async fn tracker() -> (tempfile::TempDir, ReplicaStore, SessionTracker) {
        let (dir, store) = replica().await;
        let tracker = SessionTracker::new(store.clone());
        (dir, store, tracker)
    }

    #[tokio::test]
    async fn test_start_offline_session_records_owner() {
        let (_dir, _store, tracker) = tracker().await;
        assert!(tracker.session().await.unwrap().is_none());

        tracker.start_offline_session("alice").await.unwrap();
        let session = tracker.session().await.unwrap().unwrap();
        assert_eq!(session, OfflineSession::for_user("alice"));
    }

    #[tokio::test]
    async fn test_conflicting_offline_user() {
        let (_dir, _store, tracker) = tracker().await;
        tracker.start_offline_session("alice").await.unwrap();
        tracker.set_has_offline_data(true).await.unwrap();

        let err = tracker.start_offline_session("bob").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::ConflictingOfflineUser { ref offline_user } if offline_user == "alice"
        ));

        let session = tracker.session().await.unwrap();
        assert!(SessionTracker::check_sync_allowed(session.as_ref(), "bob").is_err());
        assert!(SessionTracker::check_sync_allowed(session.as_ref(), "alice").is_ok());
    }

    #[tokio::test]
    async fn test_owner_without_data_is_replaced() {
        let (_dir, _store, tracker) = tracker().await;
        tracker.start_offline_session("alice").await.unwrap();

        let session = tracker.start_offline_session("bob").await.unwrap();
        assert_eq!(session.offline_user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_unfinished_upload_blocks_new_session() {
        let (_dir, _store, tracker) = tracker().await;
        tracker.start_offline_session("alice").await.unwrap();
        tracker.mark_upload_started(1700).await.unwrap();

        let err = tracker.start_offline_session("alice").await.unwrap_err();
        assert!(matches!(err, SyncError::UploadNotFinished));
        // Not cleared without force while an upload is pending
        assert!(!tracker.end_offline_session(false).await.unwrap());
        assert!(tracker.end_offline_session(true).await.unwrap());
        assert!(tracker.session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_offline_session_keeps_session_with_offline_rows() {
        let (_dir, store, tracker) = tracker().await;
        tracker.start_offline_session("alice").await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        store
            .insert_local(&mut conn, "publishers", &row([("name", "Vintage")]))
            .await
            .unwrap();
        drop(conn);

        assert!(tracker.has_offline_rows().await.unwrap());
        assert!(!tracker.end_offline_session(false).await.unwrap());
        assert!(tracker.session().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_upload_bracket() {
        let (_dir, store, tracker) = tracker().await;
        tracker.mark_upload_started(1700).await.unwrap();
        let session = tracker.session().await.unwrap().unwrap();
        assert!(session.upload_started);
        assert_eq!(session.upload_start_time, Some(1700));

        let mut conn = store.pool().acquire().await.unwrap();
        SessionTracker::mark_upload_finished(&mut conn).await.unwrap();
        let session = SessionTracker::load(&mut conn).await.unwrap().unwrap();
        assert!(!session.upload_started);
        assert_eq!(session.upload_start_time, None);
    }

    #[tokio::test]
    async fn test_recover_forces_clean_sync_when_artifact_finished() {
        let (_dir, _store, tracker) = tracker().await;
        tracker.mark_upload_started(1700).await.unwrap();
        let session = tracker.session().await.unwrap();

        let remote = FakeRemote::new(2000);
        remote.set_artifact_status(
            "1700_alice",
            UploadStatus {
                finished: true,
                ..Default::default()
            },
        );
        let clean = tracker
            .recover_from_crashed_upload(session.as_ref(), "alice", &remote)
            .await
            .unwrap();
        assert!(clean);
        assert!(remote.cleaned().is_empty());
    }

    #[tokio::test]
    async fn test_recover_discards_unfinished_artifact() {
        let (_dir, store, tracker) = tracker().await;
        seed_synced(
            &store,
            "publishers",
            row([("id", Value::Int(1)), ("name", Value::from("Penguin"))]),
            10,
        )
        .await;
        tracker.mark_upload_started(1700).await.unwrap();
        let session = tracker.session().await.unwrap();

        let remote = FakeRemote::new(2000);
        let clean = tracker
            .recover_from_crashed_upload(session.as_ref(), "alice", &remote)
            .await
            .unwrap();
        assert!(!clean);
        assert_eq!(remote.cleaned(), vec!["1700_alice".to_string()]);
    }

    #[tokio::test]
    async fn test_recover_is_noop_without_pending_upload() {
        let (_dir, _store, tracker) = tracker().await;
        let remote = FakeRemote::new(2000);
        let clean = tracker
            .recover_from_crashed_upload(None, "alice", &remote)
            .await
            .unwrap();
        assert!(!clean);
        assert!(remote.cleaned().is_empty());
    }
}
