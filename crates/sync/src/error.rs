//! Error types for entity synchronization.

use thiserror::Error;

use crate::deletion::DeletionCheck;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("malformed webhook payload: {0}")]
    Payload(String),

    #[error("unsupported webhook event: {0}")]
    UnsupportedEvent(String),

    #[error("identity provider request failed: {0}")]
    Identity(String),

    #[error("identity provider client is not configured")]
    IdentityNotConfigured,

    #[error("dead letter item not found")]
    DeadLetterNotFound,

    #[error("dead letter item is not retryable")]
    NotRetryable,

    #[error("dead letter item is already resolved")]
    AlreadyResolved,

    #[error("a retry for this dead letter item is already in flight")]
    RetryInFlight,

    #[error("dead letter item has no stored payload to replay")]
    PayloadUnavailable,

    #[error("account deletion blocked")]
    DeletionBlocked(DeletionCheck),

    #[error("internal sync error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a failed workflow attempt is worth retrying.
    ///
    /// Transient infrastructure failures are; malformed payloads and
    /// state-machine rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Database(_) | SyncError::Identity(_))
    }
}
