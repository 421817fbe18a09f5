//! Identity tokens attached to every backend call.
//!
//! Token refresh is opaque to the engine: the coordinator only asks for a
//! valid token and tells the provider when the backend rejected one.

use std::future::Future;

use super::error::SyncError;

pub trait TokenProvider: Send + Sync {
    /// Returns a token believed valid, blocking only as long as needed to
    /// obtain one. Failing to produce a token fails the current cycle.
    fn token(&self) -> impl Future<Output = Result<String, SyncError>> + Send;

    /// Called when the backend rejected the current token.
    fn invalidate(&self);
}

/// A fixed API key, the common case for provisioned fleet devices.
pub struct StaticTokenProvider {
    key: String,
}

impl StaticTokenProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, SyncError> {
        Ok(self.key.clone())
    }

    // A static key cannot be refreshed; a rejection will surface again on
    // the retry and park the batch through the normal attempt ceiling.
    fn invalidate(&self) {}
}
