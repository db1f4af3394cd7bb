//! Error types for the sync pipeline.
//!
//! Every fallible pipeline operation returns [`SyncResult`]. The variants are
//! split so that [`SyncError::is_retryable`] can tell transient I/O failures
//! (retried by [`crate::retry::RetryExecutor`]) from failures that must
//! surface immediately.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection-level failure talking to the relational store.
    #[error("source store unavailable: {0}")]
    SourceUnavailable(String),

    /// The store answered, but the query itself failed (bad SQL, auth, decode).
    #[error("source query failed: {0}")]
    SourceQuery(String),

    /// Connection refused, 5xx or throttling from the search index.
    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("search index rejected request ({status}): {message}")]
    IndexRejected { status: u16, message: String },

    /// The index answered with a body we could not interpret.
    #[error("unexpected search index response: {0}")]
    IndexResponse(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("state store error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the retry executor should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable(_) | SyncError::IndexUnavailable(_) | SyncError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => SyncError::SourceUnavailable(err.to_string()),
            other => SyncError::SourceQuery(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            SyncError::IndexUnavailable(err.to_string())
        } else if err.is_decode() {
            SyncError::IndexResponse(err.to_string())
        } else if let Some(status) = err.status() {
            classify_status(status.as_u16(), err.to_string())
        } else {
            SyncError::IndexUnavailable(err.to_string())
        }
    }
}

/// Map a non-success HTTP status from the index to an error.
///
/// 429 and 5xx are transient; every other status is a rejection.
pub fn classify_status(status: u16, message: String) -> SyncError {
    if status == 429 || (500..600).contains(&status) {
        SyncError::IndexUnavailable(format!("HTTP {}: {}", status, message))
    } else {
        SyncError::IndexRejected { status, message }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
