/// Error types for the dedicated servers client
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the transport, decoder, services and waiters
#[derive(Error, Debug)]
pub enum Error {
    /// Every attempt hit a network failure or a retryable status
    #[error("{method} {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        method: String,
        url: String,
        attempts: u32,
        #[source]
        last: TransportFailure,
    },

    /// Structured error reported by the API
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A success response whose body did not match the expected shape
    #[error("failed to decode HTTP {status} response from {url}: {source}; body: {body}")]
    Decode {
        status: u16,
        url: String,
        body: String,
        #[source]
        source: serde_json::Error,
    },

    /// Request could not be built or its body could not be read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error(
        "timeout after {}s waiting for {what} (last status: {})",
        .timeout.as_secs(),
        .last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        what: String,
        timeout: Duration,
        last_status: Option<String>,
    },

    #[error("{what} entered unexpected status '{status}'")]
    UnexpectedState { what: String, status: String },

    #[error("{what} failed with status '{status}': {reason}")]
    Failed {
        what: String,
        status: String,
        reason: String,
    },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// True when the backend reported the subject as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Api(api) => api.is_not_found(),
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The last failure seen by the retry loop
#[derive(Error, Debug)]
pub enum TransportFailure {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),
}

/// API error details, as returned in error bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP status of the response carrying this error
    #[serde(skip)]
    pub status: u16,
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Build an error from a status and raw body when the body is not a
    /// structured error
    pub fn from_raw(status: u16, body: &str) -> Self {
        Self {
            status,
            code: i64::from(status),
            message: body.trim().to_string(),
            details: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404 || self.code == 404
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API error {} (HTTP {}): {}", self.code, self.status, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = Error::Api(ApiError::from_raw(404, "no such server"));
        assert!(err.is_not_found());

        let err = Error::Api(ApiError::from_raw(409, "conflict"));
        assert!(!err.is_not_found());

        let err = Error::NotFound {
            what: "task 7".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError {
            status: 422,
            code: 1001,
            message: "invalid plan".to_string(),
            details: Some("plan is not available in SPB-4".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "API error 1001 (HTTP 422): invalid plan (plan is not available in SPB-4)"
        );
    }

    #[test]
    fn test_timeout_message_carries_last_status() {
        let err = Error::Timeout {
            what: "server 42".to_string(),
            timeout: Duration::from_secs(30),
            last_status: Some("provisioning".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("30s"));
        assert!(msg.contains("provisioning"));
    }
}
