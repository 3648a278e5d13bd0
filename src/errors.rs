//! Engine error types and error categorization for reporting.
//!
//! `EngineError` covers programming faults and transport-layer failures.
//! Adapters distinguish the two: transport failures are folded into a
//! `ResponseRecord` with `success = false` (and credited to the metrics
//! aggregator); programming faults propagate as `Err` and never advance
//! metrics.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the engine and its adapters.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Null/empty mandatory fields, malformed URL or connection string,
    /// or a size bound violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A connection registry or the request queue is full.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// DNS, connect, or I/O failure.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// A deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// TCP reset or orderly close observed mid-receive.
    #[error("peer closed connection")]
    PeerClosed,

    /// Unexpected framing or a short read.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The operation requires an established connection entry.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A predicate returned false. Reported, never fatal to the engine.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

impl EngineError {
    /// Coarse category for summaries and logs.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Timeout(_) => ErrorCategory::TimeoutError,
            EngineError::TransportFailed(_) | EngineError::PeerClosed => {
                ErrorCategory::NetworkError
            }
            EngineError::ProtocolError(_) => ErrorCategory::ProtocolError,
            _ => ErrorCategory::OtherError,
        }
    }
}

/// Categories of request failures observed during a load run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Deadline expiry
    TimeoutError,

    /// Framing/short-read errors
    ProtocolError,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for success/redirect responses (2xx/3xx).
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() {
            ErrorCategory::NetworkError
        } else if error.is_body() || error.is_decode() {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    /// Stable label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::ProtocolError => "protocol_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_success_codes() {
        assert_eq!(ErrorCategory::from_status_code(200), None);
        assert_eq!(ErrorCategory::from_status_code(204), None);
        assert_eq!(ErrorCategory::from_status_code(302), None);
    }

    #[test]
    fn test_categorize_error_codes() {
        assert_eq!(
            ErrorCategory::from_status_code(404),
            Some(ErrorCategory::ClientError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(503),
            Some(ErrorCategory::ServerError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(0),
            Some(ErrorCategory::OtherError)
        );
    }

    #[test]
    fn test_engine_error_category() {
        let err = EngineError::Timeout(Duration::from_secs(1));
        assert_eq!(err.category(), ErrorCategory::TimeoutError);

        let err = EngineError::PeerClosed;
        assert_eq!(err.category(), ErrorCategory::NetworkError);

        let err = EngineError::CapacityExceeded("tcp registry".to_string());
        assert_eq!(err.category(), ErrorCategory::OtherError);
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::NotConnected("ws://missing".to_string());
        assert!(err.to_string().contains("not connected"));

        let err = EngineError::CapacityExceeded("mqtt registry (50)".to_string());
        assert!(err.to_string().contains("capacity exceeded"));
    }
}
