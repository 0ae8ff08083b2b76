// src/service.rs

use crate::error::TransferError;
use crate::models::{FileFingerprint, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Parameters for opening a fresh upload session.
#[derive(Debug, Clone, Serialize)]
pub struct NewSessionRequest {
    pub fingerprint: FileFingerprint,
    pub total_size: u64,
    pub chunk_size: u32,
    pub mime_type: String,
    pub filename: String,
}

/// Server response to a session create: the issued id plus whatever
/// chunks the server already holds (empty on a fresh session).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    #[serde(default)]
    pub uploaded_chunk_indices: Vec<usize>,
}

/// Authoritative server-side view of a session. The local store is only
/// a hint; this set is what resume logic trusts.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatus {
    pub status: String,
    #[serde(default)]
    pub uploaded_chunk_indices: Vec<usize>,
}

/// The remote service that stores chunks and assembles the final object.
/// Re-uploading an already-stored chunk index is a no-op success.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn create_session(
        &self,
        request: &NewSessionRequest,
    ) -> Result<SessionHandle, TransferError>;

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        offset: u64,
        payload: Bytes,
    ) -> Result<(), TransferError>;

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, TransferError>;

    /// Valid only once every chunk is present; clears server-side session
    /// bookkeeping on success.
    async fn finalize(&self, session_id: &str) -> Result<UploadResult, TransferError>;

    /// Best-effort deletion of stored chunks and session bookkeeping.
    async fn cancel_session(&self, session_id: &str) -> Result<(), TransferError>;
}

/// HTTP implementation of [`UploadService`].
///
/// Endpoint layout:
///   POST   {base}/sessions
///   PUT    {base}/sessions/{id}/chunks/{index}
///   GET    {base}/sessions/{id}
///   POST   {base}/sessions/{id}/finalize
///   DELETE {base}/sessions/{id}
pub struct HttpUploadService {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpUploadService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            request_timeout,
        }
    }

    fn map_request_error(err: reqwest::Error) -> TransferError {
        if err.is_timeout() {
            TransferError::Timeout
        } else {
            TransferError::Network(err)
        }
    }

    /// Maps an error status onto [`TransferError`]. `session_scoped`
    /// controls whether a 404 means "session not found".
    async fn check(
        response: reqwest::Response,
        session_scoped: bool,
    ) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if session_scoped && status == StatusCode::NOT_FOUND {
            return Err(TransferError::SessionExpired);
        }
        if status.is_server_error() {
            return Err(TransferError::Server {
                status: status.as_u16(),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(TransferError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl UploadService for HttpUploadService {
    async fn create_session(
        &self,
        request: &NewSessionRequest,
    ) -> Result<SessionHandle, TransferError> {
        debug!(filename = %request.filename, total_size = request.total_size, "creating upload session");
        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        let response = Self::check(response, false).await?;
        response.json().await.map_err(Self::map_request_error)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        offset: u64,
        payload: Bytes,
    ) -> Result<(), TransferError> {
        let end = offset + payload.len() as u64 - 1;
        let response = self
            .client
            .put(format!(
                "{}/sessions/{}/chunks/{}",
                self.base_url, session_id, index
            ))
            .timeout(self.request_timeout)
            .header("Content-Range", format!("bytes {offset}-{end}/*"))
            .body(payload)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        Self::check(response, true).await?;
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, TransferError> {
        let response = self
            .client
            .get(format!("{}/sessions/{}", self.base_url, session_id))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        let response = Self::check(response, true).await?;
        response.json().await.map_err(Self::map_request_error)
    }

    async fn finalize(&self, session_id: &str) -> Result<UploadResult, TransferError> {
        debug!(session_id, "finalizing upload session");
        let response = self
            .client
            .post(format!("{}/sessions/{}/finalize", self.base_url, session_id))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        let response = Self::check(response, true).await?;
        response.json().await.map_err(Self::map_request_error)
    }

    async fn cancel_session(&self, session_id: &str) -> Result<(), TransferError> {
        let response = self
            .client
            .delete(format!("{}/sessions/{}", self.base_url, session_id))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        match Self::check(response, true).await {
            // The session being gone already is what we wanted.
            Err(TransferError::SessionExpired) => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }
}
