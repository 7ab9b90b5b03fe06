//! Error taxonomy for the ingestion pipeline

use thiserror::Error;

/// Errors surfaced by ingestion operations
///
/// Most pipeline stages degrade instead of propagating; these variants are
/// what reaches a boundary (notification handler, grant operations, cycle
/// reports).
#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed input rejected at the boundary; never retried
    #[error("invalid input: {0}")]
    Validation(String),

    /// Missing, expired or revoked credentials
    #[error("authorization required: {0}")]
    Auth(String),

    /// Network or rate-limit failure talking to the mailbox provider
    #[error("provider request failed: {0}")]
    Provider(String),

    /// The stored change cursor is too old for the provider's history
    #[error("history cursor {0} expired or invalid")]
    HistoryExpired(String),

    /// Object storage failure
    #[error("content storage failed: {0}")]
    Storage(String),

    /// Persistence boundary failure
    #[error("datastore error: {0}")]
    Datastore(#[from] anyhow::Error),
}

impl IngestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        IngestError::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        IngestError::Auth(msg.into())
    }

    /// Whether retrying the same input can ever succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IngestError::Validation(_))
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
