// src/error.rs

use thiserror::Error;

/// A single chunk-level (or session-negotiation) transport failure.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("server error: HTTP {status}")]
    Server { status: u16 },
    #[error("upload rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The server no longer knows the session id. Handled by discarding
    /// the local record and starting a fresh session, not surfaced as a
    /// failure unless the fresh attempt also fails.
    #[error("upload session no longer exists on the server")]
    SessionExpired,
}

impl TransferError {
    /// Whether this failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_) | TransferError::Timeout | TransferError::Server { .. }
        )
    }
}

/// File-level failure surfaced to the queue. Cancellation is not an
/// error; it is reported as a distinct outcome so the caller can choose
/// between pausing and discarding the session.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Raised at enqueue time, before any network call.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Session create or status query failed.
    #[error("session negotiation failed: {0}")]
    Session(TransferError),
    /// A chunk failed non-retryably, or exhausted its retry budget.
    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    Transfer {
        index: usize,
        attempts: u32,
        source: TransferError,
    },
    /// All chunks are stored but assembly failed. Retrying the file
    /// re-runs finalize alone without re-uploading chunks.
    #[error("finalize failed: {0}")]
    Finalize(TransferError),
    #[error("session store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("source read error: {0}")]
    Source(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_hundreds_and_timeouts_are_transient() {
        assert!(TransferError::Server { status: 503 }.is_transient());
        assert!(TransferError::Timeout.is_transient());
    }

    #[test]
    fn rejections_and_expiry_are_not_transient() {
        let rejected = TransferError::Rejected {
            status: 413,
            message: "too large".into(),
        };
        assert!(!rejected.is_transient());
        assert!(!TransferError::SessionExpired.is_transient());
    }
}
