//! Facade-level error type. Downstream consumers match on `NotifyError`
//! rather than reaching into each subsystem's own error enum, mirroring the
//! teacher's top-level `FlowCatalystError` wrapping `QueueError`/`RouterError`.

use notify_common::errors::{StorageError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Storage,
    DuplicateBlocked,
    FatalConfig,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct NotifyError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub status_code: Option<u16>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl NotifyError {
    pub fn fatal_config(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::FatalConfig, message: message.into(), retryable: false, status_code: None, cause: None }
    }

    pub fn duplicate_blocked(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            code: ErrorCode::DuplicateBlocked,
            message: format!("payload duplicates a prior record for key {}", key),
            retryable: false,
            status_code: None,
            cause: None,
        }
    }
}

impl From<ValidationError> for NotifyError {
    fn from(err: ValidationError) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: err.to_string(),
            retryable: false,
            status_code: None,
            cause: Some(Box::new(err)),
        }
    }
}

impl From<StorageError> for NotifyError {
    fn from(err: StorageError) -> Self {
        let retryable = err.is_retryable();
        Self { code: ErrorCode::Storage, message: err.to_string(), retryable, status_code: None, cause: Some(Box::new(err)) }
    }
}
