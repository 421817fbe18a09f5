//! Sync error taxonomy.
//!
//! Transient failures drive retry with backoff; auth expiry gets one
//! in-cycle refresh; storage errors bubble up from sqlite. A stale remote
//! update is not an error at all — the resolver handles it as an explicit
//! no-op — and a full queue is handled by the eviction policy, not here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network-level failure (connect, timeout, 5xx). Retried with backoff.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The identity token was rejected. Refresh and retry once; a repeat
    /// counts as a normal failed attempt.
    #[error("authentication token expired or rejected")]
    AuthExpired,

    /// The backend refused the request for a non-auth, non-transient reason.
    #[error("backend rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Sync requires both a server URL and an API key.
    #[error("sync not configured: set sync.server_url and sync.api_key")]
    NotConfigured,
}

impl SyncError {
    /// Whether the push/pull attempt may be retried after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::AuthExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Transient("timeout".into()).is_retryable());
        assert!(SyncError::AuthExpired.is_retryable());
        assert!(!SyncError::Rejected {
            status: 422,
            message: "bad batch".into()
        }
        .is_retryable());
        assert!(!SyncError::NotConfigured.is_retryable());
    }
}
