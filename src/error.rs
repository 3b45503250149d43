//! Error types for Mailflow.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the automation core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Summarizer error: {0}")]
    Summarizer(#[from] SummarizerError),
}

/// Payload and request validation errors.
///
/// Always fatal to the single invocation — a malformed payload is a
/// structural bug, never something a retry can fix.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Action kind '{kind}' is not delayable")]
    NotDelayable { kind: String },

    #[error("scheduled_for must be in the future (got {scheduled_for})")]
    NonPositiveDelay { scheduled_for: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Persistence errors from the automation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Enqueue failed: {0}")]
    Enqueue(String),

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Queue is shut down")]
    ShutDown,
}

/// Upstream mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No provider configured for account {account_id}")]
    NoProvider { account_id: String },

    #[error("Message {message_id} not found")]
    MessageGone { message_id: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation {op} not supported by this provider")]
    Unsupported { op: &'static str },

    #[error("Send failed: {0}")]
    SendFailed(String),
}

impl ProviderError {
    /// Whether a retry with backoff can plausibly succeed.
    ///
    /// `MessageGone` is deliberately not retryable — the executor treats a
    /// vanished target as completed, not as an error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Auth(_) | Self::Network(_) | Self::SendFailed(_)
        )
    }
}

/// Summarizer collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Summarizer request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid summarizer response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for the automation core.
pub type Result<T> = std::result::Result<T, Error>;
