//! Offline-first synchronization of the local replica with a remote store.
//!
//! A sync round runs against a [`RemoteAuthority`] in one local
//! transaction, in a fixed order:
//!
//! 1. remote deletes are applied, protecting unsynced local work
//! 2. local changes are uploaded and the remote's verdict (key
//!    translations and unique conflicts) is applied
//! 3. remote changes are pulled page by page up to the round's timestamp
//!
//! Either all of it commits or none of it does. An offline session tracks
//! which user owns unsynced data and whether an upload was interrupted, so
//! the next round can recover.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use replica_sync::db::{init_db, ReplicaStore};
//! use replica_sync::sync::{EngineOptions, HttpRemote, SyncEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = init_db("replica.db".as_ref()).await?;
//! let store = ReplicaStore::open(pool, &["books".to_string()]).await?;
//! let remote = HttpRemote::new("https://sync.example.com".to_string(), None)?;
//! let engine = SyncEngine::new(store, Arc::new(remote), EngineOptions::default());
//! let report = engine.run_sync_round("alice").await?;
//! println!("pulled {} rows", report.pull.rows);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod deletes;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod pull;
pub mod retry;
pub mod session;
#[cfg(test)]
mod testing;
pub mod upload;

pub use client::{HttpRemote, RemoteAuthority};
pub use deletes::{DeleteReconciler, DeleteReport};
pub use engine::{EngineOptions, NoWakeLock, RoundReport, RoundState, SyncEngine, WakeLock};
pub use error::SyncError;
pub use protocol::{
    artifact_name, ArtifactHandle, ChangePage, ChangePages, RemoteDelete, RemoteDeletes,
    RemoteErrorBody, SyncCursor, SyncCursors, TableChanges, Translations, UploadBatch,
    UploadStatus,
};
pub use pull::{prepare_cursors, DownloadPuller, PullReport, DEFAULT_MAX_PULL_ITERATIONS};
pub use retry::RetryPolicy;
pub use session::{OfflineSession, SessionTracker};
pub use upload::{UploadCoordinator, UploadReport};
