//! Failure taxonomy for calls against the YMGal archive API.
//!
//! [`HttpFailure`] keeps enough of the HTTP response to classify it into a
//! [`FailureKind`]: 503/429 are throttling, 408 and 5xx are transient, every
//! other 4xx will not succeed on retry.

use std::time::Duration;

use thiserror::Error;

use crate::error::FailureKind;

#[derive(Debug, Error)]
pub enum HttpFailure {
    /// HTTP 503 (or 429). `retry_after` comes from the `Retry-After` header.
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected, even after a token refresh.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other non-success status.
    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    /// DNS, refused connection, reset.
    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl HttpFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            HttpFailure::RateLimited { .. } => FailureKind::RateLimited,
            HttpFailure::Unauthorized(_) => FailureKind::Fatal,
            HttpFailure::Status { status, .. } => match *status {
                408 => FailureKind::Transient,
                400..=499 => FailureKind::Fatal,
                _ => FailureKind::Transient,
            },
            HttpFailure::Timeout | HttpFailure::Network(_) | HttpFailure::Decode(_) => {
                FailureKind::Transient
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HttpFailure::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HttpFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpFailure::Timeout
        } else if err.is_decode() {
            HttpFailure::Decode(err.to_string())
        } else {
            HttpFailure::Network(err.to_string())
        }
    }
}
