//! The backend realtime store, behind a narrow trait.
//!
//! The engine only ever pushes sample batches and pulls updates for watched
//! entities, so that is the whole surface — which also keeps the core
//! testable against an in-memory fake instead of a live backend.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SyncError;
use crate::models::LocationSample;

/// Updates for watched entities, plus the cursor to resume from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub updates: Vec<LocationSample>,
    pub cursor: i64,
}

pub trait RemoteStore: Send + Sync {
    /// Pushes a batch of samples. At-least-once: the backend upserts by
    /// (entity_id, sequence_no), so re-delivery of an applied sample is a
    /// no-op.
    fn push(
        &self,
        token: &str,
        batch: &[LocationSample],
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Long-polls for updates to the watched entities after `cursor`.
    /// Returns immediately when updates exist, otherwise waits up to `wait`.
    fn pull(
        &self,
        token: &str,
        cursor: i64,
        watched: &[String],
        wait: Duration,
    ) -> impl Future<Output = Result<PullResponse, SyncError>> + Send;
}

/// HTTP client for the fleettrack sync server.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            base_url: server_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Builds an HTTP URL for a given path.
    fn build_url(&self, path: &str) -> String {
        let base = if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://")
        {
            format!("http://{}", self.base_url)
        } else {
            self.base_url.clone()
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    /// Probes the server's unauthenticated health endpoint.
    pub async fn health(&self) -> Result<(), SyncError> {
        let response = self
            .client
            .get(self.build_url("/health"))
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Self::classify_status(status, body))
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> SyncError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            SyncError::AuthExpired
        } else if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            SyncError::Transient(format!("server returned {}", status))
        } else {
            SyncError::Rejected {
                status: status.as_u16(),
                message: body,
            }
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn push(&self, token: &str, batch: &[LocationSample]) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.build_url("/v1/samples"))
            .header("Authorization", format!("Bearer {}", token))
            .json(batch)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Self::classify_status(status, body))
        }
    }

    async fn pull(
        &self,
        token: &str,
        cursor: i64,
        watched: &[String],
        wait: Duration,
    ) -> Result<PullResponse, SyncError> {
        let response = self
            .client
            .get(self.build_url("/v1/updates"))
            .header("Authorization", format!("Bearer {}", token))
            .query(&[
                ("cursor", cursor.to_string()),
                ("wait_secs", wait.as_secs().to_string()),
                ("entities", watched.join(",")),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| SyncError::Transient(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Self::classify_status(status, body))
        }
    }
}
