//! Response records and per-protocol trailers.

use crate::request::Protocol;
use serde::{Deserialize, Serialize};

/// Protocol-specific response data, attached to a [`ResponseRecord`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Trailer {
    #[default]
    None,

    WebSocket {
        subprotocol: String,
        messages_sent: u64,
        messages_received: u64,
        bytes_sent: u64,
        bytes_received: u64,
    },

    Database {
        rows_affected: u64,
        rows_returned: u64,
        result_set: String,
    },

    Tcp {
        socket_id: u64,
        bytes_sent: u64,
        bytes_received: u64,
        connect_time_us: u64,
    },

    Udp {
        socket_id: u64,
        bytes_sent: u64,
        bytes_received: u64,
        remote_host: String,
        remote_port: u16,
    },

    Mqtt {
        message_published: bool,
        message_received: bool,
        published_count: u64,
        received_count: u64,
        topic: String,
        last_message: String,
        qos_level: u8,
        retained: bool,
        publish_time_us: u64,
    },
}

/// Outcome of one protocol operation.
///
/// `response_time_us` is populated even on failure so that failures
/// contribute to latency observations. `success` reflects transport state
/// plus (for HTTP) the status class; assertion outcomes are reported
/// separately and never rewrite the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub protocol: Protocol,

    /// Protocol status. 0 means the transport failed before any status
    /// was available.
    pub status_code: u16,

    /// Captured headers as a newline-delimited blob, truncated to the
    /// header bound.
    pub headers: String,

    /// Captured body, UTF-8 best effort, truncated to the body bound.
    pub body: String,

    pub response_time_us: u64,
    pub success: bool,

    /// Human-readable transport/protocol error; empty on success.
    pub error_message: String,

    pub trailer: Trailer,
}

impl ResponseRecord {
    /// Successful record with the given status.
    pub fn ok(protocol: Protocol, status_code: u16, response_time_us: u64) -> Self {
        Self {
            protocol,
            status_code,
            headers: String::new(),
            body: String::new(),
            response_time_us,
            success: true,
            error_message: String::new(),
            trailer: Trailer::None,
        }
    }

    /// Failed record carrying a status and an error description.
    pub fn failed(
        protocol: Protocol,
        status_code: u16,
        response_time_us: u64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            status_code,
            headers: String::new(),
            body: String::new(),
            response_time_us,
            success: false,
            error_message: error_message.into(),
            trailer: Trailer::None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = headers.into();
        self
    }

    pub fn with_trailer(mut self, trailer: Trailer) -> Self {
        self.trailer = trailer;
        self
    }

    /// Response time in milliseconds, for display.
    pub fn response_time_ms(&self) -> u64 {
        self.response_time_us / 1_000
    }
}
