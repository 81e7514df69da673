//! Sync error types.

use crate::db::StoreError;

/// Errors that can end a sync round or an offline-session operation.
///
/// Every error inside a round rolls the whole round back.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Another user still has unsynced offline data on this device.
    #[error("The sync is not available, '{offline_user}' has not yet uploaded offline data.")]
    ConflictingOfflineUser { offline_user: String },

    /// A previous upload was interrupted and has not been recovered yet.
    #[error("A previous synchronization did not finish. Please try it again.")]
    UploadNotFinished,

    /// The remote did not finish processing the upload in time.
    #[error("Unable to get the upload result for '{artifact}' after {attempts} polls")]
    UploadTimeout { artifact: String, attempts: u32 },

    /// The remote finished processing the upload with an error.
    #[error("Remote rejected the upload: {0}")]
    RemoteRejected(String),

    /// Local replica failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// HTTP transport failure or unexpected response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A round is already running on this engine.
    #[error("A sync round is already in progress")]
    RoundInProgress,

    /// Persisted session state could not be read or written.
    #[error("Invalid offline session state: {0}")]
    Session(#[from] serde_json::Error),

    /// Sync is not configured.
    #[error("Sync not configured. Add server_url to config.")]
    NotConfigured,
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Storage(StoreError::Sqlite(e))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl SyncError {
    /// Whether the next round may succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::UploadTimeout { .. } | SyncError::Transport(_) | SyncError::RoundInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicting_user_message() {
        let err = SyncError::ConflictingOfflineUser {
            offline_user: "alice@example.com".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The sync is not available, 'alice@example.com' has not yet uploaded offline data."
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = SyncError::UploadTimeout {
            artifact: "100_bob".to_string(),
            attempts: 60,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("100_bob"));
    }
}
