//! Typed broker errors.
//!
//! The variants follow the caller-facing taxonomy: validation and conflict
//! errors are raised synchronously before any state is mutated, substrate
//! outages are retryable, and external command failures never appear here
//! (they are recorded into `last_operation` instead).

use thiserror::Error;

/// Coarse class of a [`BrokerError`], used by callers to map responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Conflict,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid parameters: not allowed [{disallowed}], missing required [{missing}]")]
    InvalidParameters { disallowed: String, missing: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A document failed schema validation. Always a programming error.
    #[error("{kind} document failed validation: {reason}")]
    Schema { kind: &'static str, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::InvalidRequest(_) | BrokerError::InvalidParameters { .. } => {
                ErrorKind::InvalidRequest
            }
            BrokerError::Conflict(_) => ErrorKind::Conflict,
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::Unavailable(_) => ErrorKind::Unavailable,
            BrokerError::Schema { .. } | BrokerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only substrate outages warrant caller-side retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    pub fn unavailable(context: &str, err: &anyhow::Error) -> Self {
        BrokerError::Unavailable(format!("{context}: {err:#}"))
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors raised while validating [`crate::domain::config::BrokerConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{key} must not be empty")]
    Empty { key: &'static str },

    #[error("lock_lease_secs must be at least 3 seconds to allow renewal, got {0}")]
    LeaseTooShort(u64),
}
