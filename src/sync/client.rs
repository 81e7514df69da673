//! HTTP client for the remote authority.
//!
//! The engine talks to the remote through the [`RemoteAuthority`] trait.
//! [`HttpRemote`] is the production implementation on top of `reqwest`.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::error::SyncError;
use super::protocol::{
    ArtifactHandle, ChangePages, CleanSyncDirRequest, DeletesRequest, DeletesResponse,
    LoadChangesRequest, RemoteDeletes, SyncCursors, SyncTimestampResponse, UploadBatch,
    UploadRequest, UploadResponse, UploadStatus,
};
use crate::config::SyncConfig;
use crate::db::Timestamp;

/// The remote store's sync endpoints.
#[async_trait::async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Mints the boundary timestamp of a new round.
    async fn sync_timestamp(&self) -> Result<Timestamp, SyncError>;

    /// Rows deleted remotely at or before `sync_timestamp`.
    async fn deletes(
        &self,
        cursors: &SyncCursors,
        sync_timestamp: Timestamp,
    ) -> Result<RemoteDeletes, SyncError>;

    /// Submits local changes. Processing continues asynchronously.
    async fn upload_changes(
        &self,
        changes: &UploadBatch,
        sync_timestamp: Timestamp,
    ) -> Result<ArtifactHandle, SyncError>;

    /// Completion status of an upload artifact.
    async fn upload_status(&self, artifact: &str) -> Result<UploadStatus, SyncError>;

    /// Removes the server-side artifact of an upload.
    async fn clean_sync_dir(&self, artifact: &str) -> Result<(), SyncError>;

    /// One page of incremental changes per table.
    async fn load_changes(
        &self,
        cursors: &SyncCursors,
        load_until: Timestamp,
    ) -> Result<ChangePages, SyncError>;
}

/// Remote authority reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    server_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpRemote {
    /// Creates a client from config.
    ///
    /// Returns an error if no server URL is configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let server_url = config
            .server_url
            .clone()
            .ok_or(SyncError::NotConfigured)?;
        Self::new(server_url, config.api_key.clone())
    }

    pub fn new(server_url: String, api_key: Option<String>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            server_url,
            api_key,
            http,
        })
    }

    /// Builds the URL of a sync endpoint.
    fn build_http_url(&self, endpoint: &str) -> String {
        // Accept ws(s) URLs from older configs and bare hosts
        let base_url = if self.server_url.starts_with("ws://") {
            self.server_url.replacen("ws://", "http://", 1)
        } else if self.server_url.starts_with("wss://") {
            self.server_url.replacen("wss://", "https://", 1)
        } else if !self.server_url.starts_with("http://")
            && !self.server_url.starts_with("https://")
        {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}/sync/{}", base_url.trim_end_matches('/'), endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl RemoteAuthority for HttpRemote {
    async fn sync_timestamp(&self) -> Result<Timestamp, SyncError> {
        let request = self.http.get(self.build_http_url("sync_timestamp"));
        let response = self.authorize(request).send().await?;
        let body: SyncTimestampResponse = Self::parse(response).await?;
        Ok(body.sync_timestamp)
    }

    async fn deletes(
        &self,
        cursors: &SyncCursors,
        sync_timestamp: Timestamp,
    ) -> Result<RemoteDeletes, SyncError> {
        let request = self
            .http
            .post(self.build_http_url("deletes"))
            .json(&DeletesRequest {
                sync_timestamp,
                sync_infos: cursors,
            });
        let response = self.authorize(request).send().await?;
        let body: DeletesResponse = Self::parse(response).await?;
        Ok(body.deletes)
    }

    async fn upload_changes(
        &self,
        changes: &UploadBatch,
        sync_timestamp: Timestamp,
    ) -> Result<ArtifactHandle, SyncError> {
        let request = self
            .http
            .post(self.build_http_url("offline_changes"))
            .json(&UploadRequest {
                changes,
                sync_timestamp,
            });
        let response = self.authorize(request).send().await?;
        let body: UploadResponse = Self::parse(response).await?;
        Ok(body.sync_dir)
    }

    async fn upload_status(&self, artifact: &str) -> Result<UploadStatus, SyncError> {
        let url = format!(
            "{}?dir_name={}",
            self.build_http_url("upload_finished"),
            urlencoding::encode(artifact)
        );
        let response = self.authorize(self.http.get(url)).send().await?;
        Self::parse(response).await
    }

    async fn clean_sync_dir(&self, artifact: &str) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.build_http_url("clean_sync_dir"))
            .json(&CleanSyncDirRequest { dir_name: artifact });
        let response = self.authorize(request).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "HTTP {} cleaning '{}'",
                response.status().as_u16(),
                artifact
            )));
        }
        Ok(())
    }

    async fn load_changes(
        &self,
        cursors: &SyncCursors,
        load_until: Timestamp,
    ) -> Result<ChangePages, SyncError> {
        let request = self
            .http
            .post(self.build_http_url("load_changes"))
            .json(&LoadChangesRequest {
                sync_infos: cursors,
                load_until,
            });
        let response = self.authorize(request).send().await?;
        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_http_url_with_http() {
        let client = HttpRemote::new("http://localhost:3000".to_string(), None).unwrap();
        let url = client.build_http_url("sync_timestamp");
        assert_eq!(url, "http://localhost:3000/sync/sync_timestamp");
    }

    #[test]
    fn test_build_http_url_with_ws() {
        let client = HttpRemote::new("wss://sync.example.com/".to_string(), None).unwrap();
        let url = client.build_http_url("deletes");
        assert_eq!(url, "https://sync.example.com/sync/deletes");
    }

    #[test]
    fn test_build_http_url_bare_host() {
        let client =
            HttpRemote::new("localhost:3000".to_string(), Some("key".to_string())).unwrap();
        let url = client.build_http_url("load_changes");
        assert_eq!(url, "http://localhost:3000/sync/load_changes");
    }

    #[test]
    fn test_from_config_requires_server_url() {
        let config = SyncConfig::default();
        assert!(matches!(
            HttpRemote::from_config(&config),
            Err(SyncError::NotConfigured)
        ));
    }

    #[test]
    fn test_from_config_builds_client() {
        let config = SyncConfig {
            server_url: Some("sync.example.com".to_string()),
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        let client = HttpRemote::from_config(&config).unwrap();
        assert_eq!(
            client.build_http_url("upload_finished"),
            "http://sync.example.com/sync/upload_finished"
        );
    }
}
