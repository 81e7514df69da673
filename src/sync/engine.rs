//! The sync round: deletes, then uploads, then pulls, in one transaction.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::RemoteAuthority;
use super::deletes::{DeleteReconciler, DeleteReport};
use super::error::SyncError;
use super::pull::{prepare_cursors, DownloadPuller, PullReport, DEFAULT_MAX_PULL_ITERATIONS};
use super::retry::RetryPolicy;
use super::session::SessionTracker;
use super::upload::{UploadCoordinator, UploadReport};
use crate::db::{ReplicaStore, Timestamp};

/// Phase of the running round, published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundState {
    Idle,
    Preparing,
    Deleting,
    Uploading,
    Pulling,
    Committing,
    Failed,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundState::Idle => "idle",
            RoundState::Preparing => "preparing",
            RoundState::Deleting => "deleting",
            RoundState::Uploading => "uploading",
            RoundState::Pulling => "pulling",
            RoundState::Committing => "committing",
            RoundState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Summary of a committed round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub sync_timestamp: Timestamp,
    /// The replica was wiped and fully re-pulled.
    pub clean_sync: bool,
    pub deletes: DeleteReport,
    pub upload: UploadReport,
    pub pull: PullReport,
}

/// Keeps the device awake while a round runs. Best-effort.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn release(&self);
}

/// Wake lock for platforms without one.
#[derive(Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn release(&self) {}
}

/// Tuning of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub retry: RetryPolicy,
    pub max_pull_iterations: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_pull_iterations: DEFAULT_MAX_PULL_ITERATIONS,
        }
    }
}

/// Publishes `Idle` when a round ends, including when it is cancelled.
struct RoundGuard<'a> {
    state: &'a watch::Sender<RoundState>,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(RoundState::Idle);
    }
}

/// Releases a held wake lock when a round ends, including when it is cancelled.
struct WakeGuard<'a> {
    lock: &'a dyn WakeLock,
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Owns the replica and runs sync rounds against one remote authority.
///
/// Rounds never interleave: a round requested while another is running
/// fails with [`SyncError::RoundInProgress`].
pub struct SyncEngine {
    store: ReplicaStore,
    sessions: SessionTracker,
    remote: Arc<dyn RemoteAuthority>,
    options: EngineOptions,
    wake_lock: Arc<dyn WakeLock>,
    round: Mutex<()>,
    state: watch::Sender<RoundState>,
}

impl SyncEngine {
    pub fn new(
        store: ReplicaStore,
        remote: Arc<dyn RemoteAuthority>,
        options: EngineOptions,
    ) -> Self {
        let (state, _) = watch::channel(RoundState::Idle);
        Self {
            sessions: SessionTracker::new(store.clone()),
            store,
            remote,
            options,
            wake_lock: Arc::new(NoWakeLock),
            round: Mutex::new(()),
            state,
        }
    }

    pub fn with_wake_lock(mut self, wake_lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn state(&self) -> RoundState {
        *self.state.borrow()
    }

    /// Receives every phase change of upcoming rounds.
    pub fn subscribe(&self) -> watch::Receiver<RoundState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RoundState) {
        debug!(state = %state, "Sync round state");
        self.state.send_replace(state);
    }

    /// Runs a round as a background task.
    pub fn spawn_round(
        self: &Arc<Self>,
        user: impl Into<String>,
    ) -> JoinHandle<Result<RoundReport, SyncError>> {
        let engine = Arc::clone(self);
        let user = user.into();
        tokio::spawn(async move { engine.run_sync_round(&user).await })
    }

    /// Runs one all-or-nothing sync round for `user`.
    ///
    /// On failure the replica is left as it was, except for the
    /// upload-started marker that lets the next round recover.
    pub async fn run_sync_round(&self, user: &str) -> Result<RoundReport, SyncError> {
        let _round = self.round.try_lock().map_err(|_| SyncError::RoundInProgress)?;
        let _guard = RoundGuard { state: &self.state };
        self.set_state(RoundState::Preparing);

        let _wake = match self.wake_lock.acquire() {
            Ok(()) => Some(WakeGuard {
                lock: self.wake_lock.as_ref(),
            }),
            Err(e) => {
                warn!(error = %e, "Wake lock not available");
                None
            }
        };
        let result = self.round(user).await;

        match &result {
            Ok(report) => info!(
                sync_timestamp = report.sync_timestamp,
                clean_sync = report.clean_sync,
                deleted = report.deletes.applied,
                uploaded = report.upload.inserts + report.upload.updates + report.upload.deletes,
                pulled = report.pull.rows,
                "Sync round committed"
            ),
            Err(e) => {
                self.set_state(RoundState::Failed);
                warn!(error = %e, "Sync round rolled back");
            }
        }
        result
    }

    async fn round(&self, user: &str) -> Result<RoundReport, SyncError> {
        let session = self.sessions.session().await?;
        SessionTracker::check_sync_allowed(session.as_ref(), user)?;
        let clean_sync = self
            .sessions
            .recover_from_crashed_upload(session.as_ref(), user, self.remote.as_ref())
            .await?;

        let sync_timestamp = self.remote.sync_timestamp().await?;
        self.sessions.mark_upload_started(sync_timestamp).await?;

        let mut conn = self.store.pool().acquire().await?;
        // Never hand a connection with integrity checks off back to the pool
        conn.close_on_drop();
        ReplicaStore::set_foreign_keys(&mut conn, false).await?;

        let result = self
            .run_in_transaction(&mut conn, sync_timestamp, clean_sync)
            .await;

        if let Err(e) = ReplicaStore::set_foreign_keys(&mut conn, true).await {
            warn!(error = %e, "Unable to re-enable foreign keys");
        }
        let report = result?;

        if let Some(artifact) = &report.upload.artifact {
            if let Err(e) = self.remote.clean_sync_dir(artifact).await {
                warn!(artifact = %artifact, error = %e, "Unable to clean sync dir");
            }
        }
        Ok(report)
    }

    async fn run_in_transaction(
        &self,
        conn: &mut SqliteConnection,
        sync_timestamp: Timestamp,
        clean_sync: bool,
    ) -> Result<RoundReport, SyncError> {
        let mut tx = conn.begin().await?;

        match self.phases(&mut tx, sync_timestamp, clean_sync).await {
            Ok(report) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn phases(
        &self,
        conn: &mut SqliteConnection,
        sync_timestamp: Timestamp,
        clean_sync: bool,
    ) -> Result<RoundReport, SyncError> {
        let remote = self.remote.as_ref();

        if clean_sync {
            info!("Clean sync, wiping synced tables");
            self.store.clear_all(conn).await?;
        }
        let mut cursors = prepare_cursors(&self.store, conn).await?;

        self.set_state(RoundState::Deleting);
        let deletes = DeleteReconciler::new(&self.store, remote)
            .apply(conn, &cursors, sync_timestamp)
            .await?;

        self.set_state(RoundState::Uploading);
        let upload = UploadCoordinator::new(&self.store, remote, &self.options.retry)
            .upload(conn, sync_timestamp)
            .await?;

        self.set_state(RoundState::Pulling);
        let pull = DownloadPuller::new(&self.store, remote, self.options.max_pull_iterations)
            .pull(conn, &mut cursors, sync_timestamp)
            .await?;

        self.set_state(RoundState::Committing);
        SessionTracker::mark_upload_finished(conn).await?;
        // Everything offline is uploaded, the session ends with the round
        SessionTracker::clear(conn).await?;

        Ok(RoundReport {
            sync_timestamp,
            clean_sync,
            deletes,
            upload,
            pull,
        })
    }

    /// Deletes every synced row and its sync info outside of a round.
    pub async fn clear_local_data(&self) -> Result<(), SyncError> {
        let _round = self.round.try_lock().map_err(|_| SyncError::RoundInProgress)?;
        self.sessions.clear_local_data().await
    }
}
