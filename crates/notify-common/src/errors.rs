//! Error taxonomy shared by every subsystem crate. The facade-level
//! `NotifyError` lives in `notify-queue`, not here, since it aggregates
//! these into a single externally-facing shape.

use thiserror::Error;

/// Rejected at enqueue time, before anything touches storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("payload is missing a recipient")]
    MissingRecipient,
    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
}

/// Errors surfaced by `Storage` implementations. `Transient` failures are
/// safe to retry the surrounding operation; `Permanent` are not.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("permanent storage failure: {0}")]
    Permanent(String),
    #[error("item {0} not found")]
    NotFound(uuid::Uuid),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Returned by a `ChannelHandler::send` call. `should_retry` tells the
/// processor whether the attempt counts toward `max_attempts` with a future
/// retry, or is fatal and should dead-letter immediately.
#[derive(Debug, Clone, Error)]
#[error("handler error: {message}")]
pub struct HandlerError {
    pub message: String,
    pub should_retry: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), should_retry: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), should_retry: false }
    }
}

/// Which kind of key a rate-limit bucket is keyed on, echoed back on denial
/// so callers can decide what to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RateLimitKeyType {
    Global,
    Channel,
    Recipient,
    User,
    ChannelRecipient,
}

impl std::fmt::Display for RateLimitKeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RateLimitKeyType::Global => "global",
            RateLimitKeyType::Channel => "channel",
            RateLimitKeyType::Recipient => "recipient",
            RateLimitKeyType::User => "user",
            RateLimitKeyType::ChannelRecipient => "channel_recipient",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded for {key_type} bucket, retry after {retry_after_ms}ms")]
pub struct RateLimitError {
    pub key_type: RateLimitKeyType,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Error)]
#[error("duplicate blocked for key '{key}'")]
pub struct DuplicateBlockedError {
    pub key: String,
}

/// A configuration problem severe enough that the component cannot start.
#[derive(Debug, Clone, Error)]
#[error("fatal configuration error: {0}")]
pub struct FatalConfigError(pub String);
