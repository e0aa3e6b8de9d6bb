//! The server endpoints the sync engine talks to.
//!
//! [`SyncServer`] is the seam between the engine and the network; the
//! orchestrator and the connectivity monitor only ever see this trait.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::client::ApiClient;
use crate::api::error::ApiError;
use crate::db::{ChangeMethod, PendingChange};
use crate::sync::{ServerVersion, SyncError, SyncResult};

/// Body of `GET /api/connection/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: String,
    #[serde(default)]
    pub offline_mode: bool,
}

impl ConnectionStatus {
    /// The server is up and not in maintenance/offline mode.
    pub fn is_connected(&self) -> bool {
        self.status == "connected" && !self.offline_mode
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSync {
    #[serde(default)]
    pub total: u64,
}

/// Body of `GET /api/sync/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSyncStatus {
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_sync: PendingSync,
}

/// Body of `POST /api/sync/trigger`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Everything the engine needs from the server.
pub trait SyncServer: Send + Sync + 'static {
    fn connection_status(&self) -> impl Future<Output = SyncResult<ConnectionStatus>> + Send;

    fn sync_status(&self) -> impl Future<Output = SyncResult<RemoteSyncStatus>> + Send;

    fn trigger_sync(&self) -> impl Future<Output = SyncResult<TriggerResponse>> + Send;

    /// Apply one queued change. Resending the same change id must be harmless.
    fn submit_change(&self, change: &PendingChange) -> impl Future<Output = SyncResult<()>> + Send;
}

impl<S: SyncServer> SyncServer for Arc<S> {
    fn connection_status(&self) -> impl Future<Output = SyncResult<ConnectionStatus>> + Send {
        (**self).connection_status()
    }

    fn sync_status(&self) -> impl Future<Output = SyncResult<RemoteSyncStatus>> + Send {
        (**self).sync_status()
    }

    fn trigger_sync(&self) -> impl Future<Output = SyncResult<TriggerResponse>> + Send {
        (**self).trigger_sync()
    }

    fn submit_change(&self, change: &PendingChange) -> impl Future<Output = SyncResult<()>> + Send {
        (**self).submit_change(change)
    }
}

/// [`SyncServer`] over HTTP.
#[derive(Clone)]
pub struct HttpSyncServer {
    client: ApiClient,
}

impl HttpSyncServer {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

fn http_method(method: ChangeMethod) -> Method {
    match method {
        ChangeMethod::Create => Method::POST,
        ChangeMethod::Update => Method::PUT,
        ChangeMethod::Delete => Method::DELETE,
    }
}

impl From<ApiError> for SyncError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Status { status, message } => SyncError::from_status(status, message),
            other => SyncError::TransientNetwork {
                message: other.to_string(),
            },
        }
    }
}

impl SyncServer for HttpSyncServer {
    async fn connection_status(&self) -> SyncResult<ConnectionStatus> {
        let response = self
            .client
            .get("/api/connection/status")
            .send()
            .await
            .map_err(ApiError::from)?;
        Ok(ApiClient::handle_response(response).await?)
    }

    async fn sync_status(&self) -> SyncResult<RemoteSyncStatus> {
        let response = self
            .client
            .get("/api/sync/status")
            .send()
            .await
            .map_err(ApiError::from)?;
        Ok(ApiClient::handle_response(response).await?)
    }

    async fn trigger_sync(&self) -> SyncResult<TriggerResponse> {
        let response = self
            .client
            .post("/api/sync/trigger")
            .send()
            .await
            .map_err(ApiError::from)?;
        Ok(ApiClient::handle_response(response).await?)
    }

    async fn submit_change(&self, change: &PendingChange) -> SyncResult<()> {
        let mut request = self
            .client
            .request(http_method(change.target.method), &change.target.resource)
            .header("Idempotency-Key", &change.id)
            .header("X-Enqueued-At", change.enqueued_at.to_rfc3339());
        if change.force {
            request = request.header("X-Force-Overwrite", "true");
        }
        if change.target.method != ChangeMethod::Delete {
            request = request.json(&change.payload);
        }

        let response = request.send().await.map_err(ApiError::from)?;
        let status = response.status();
        debug!(id = %change.id, target = %change.target, status = status.as_u16(), "Submitted change");

        if status.is_success() {
            return Ok(());
        }

        match status {
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                let server: ServerVersion = serde_json::from_str(&body).unwrap_or_default();
                Err(SyncError::ConflictDetected(server))
            }
            StatusCode::NOT_FOUND if change.target.method != ChangeMethod::Create => {
                Err(SyncError::ConflictDetected(ServerVersion::deleted()))
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(SyncError::from_status(status.as_u16(), message))
            }
        }
    }
}
