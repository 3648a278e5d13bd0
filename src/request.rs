//! Request descriptors and the protocol tag.
//!
//! A [`RequestDescriptor`] is a value type: method, URL, a newline-delimited
//! header blob, a bounded body, a deadline and an optional protocol-specific
//! payload. Descriptors carry no references outside the enclosing scenario.

use crate::common::{MAX_BODY_BYTES, MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES, MAX_URL_BYTES};
use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire protocol a request or response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
    Tcp,
    Udp,
    Mqtt,
    Database,
    /// Reserved for a future gRPC adapter; dispatch rejects it today.
    Grpc,
}

impl Protocol {
    /// Stable label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Mqtt => "mqtt",
            Protocol::Database => "database",
            Protocol::Grpc => "grpc",
        }
    }

    /// Default port for this protocol's plain scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::WebSocket => 80,
            Protocol::Tcp => 80,
            Protocol::Udp => 53,
            Protocol::Mqtt => 1883,
            Protocol::Database => 0,
            Protocol::Grpc => 443,
        }
    }
}

/// Protocol-specific request payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum ProtocolPayload {
    #[default]
    None,

    WebSocket {
        /// Subprotocol offered during the handshake; empty for none.
        subprotocol: String,
        /// Ping cadence requested for the connection.
        ping_interval: Option<Duration>,
    },

    Database {
        connection_string: String,
        query: String,
        /// Driver tag, e.g. "simulated".
        driver: String,
    },

    Mqtt {
        client_id: String,
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
        keep_alive_s: u16,
    },
}

/// A single protocol request: what to send, where, and within what deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Operation verb. HTTP methods for HTTP; adapters define their own
    /// verbs elsewhere ("CONNECT", "PUBLISH", ...).
    pub method: String,

    /// Target URL. Scheme selects the adapter at dispatch time.
    pub url: String,

    /// Newline-delimited `Name: value` header blob.
    pub headers: String,

    /// Request body; bounded by [`MAX_BODY_BYTES`].
    pub body: String,

    /// Total deadline for the operation.
    pub timeout: Duration,

    /// Protocol-specific extras.
    pub payload: ProtocolPayload,
}

impl RequestDescriptor {
    /// GET request with a 30 s deadline.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: String::new(),
            body: String::new(),
            timeout: Duration::from_secs(30),
            payload: ProtocolPayload::None,
        }
    }

    /// POST request with a body and a 30 s deadline.
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Self::get(url)
        }
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = headers.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_payload(mut self, payload: ProtocolPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Validate mandatory fields and size bounds.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.url.trim().is_empty() {
            return Err(EngineError::InvalidArgument("empty URL".to_string()));
        }
        if self.url.len() > MAX_URL_BYTES {
            return Err(EngineError::InvalidArgument(format!(
                "URL exceeds {} bytes",
                MAX_URL_BYTES
            )));
        }
        if self.headers.len() > MAX_HEADER_BYTES {
            return Err(EngineError::InvalidArgument(format!(
                "header blob exceeds {} bytes",
                MAX_HEADER_BYTES
            )));
        }
        if self.body.len() > MAX_BODY_BYTES {
            return Err(EngineError::InvalidArgument(format!(
                "body exceeds {} bytes",
                MAX_BODY_BYTES
            )));
        }
        if self.payload_len() > MAX_PAYLOAD_BYTES {
            return Err(EngineError::InvalidArgument(format!(
                "protocol payload exceeds {} bytes",
                MAX_PAYLOAD_BYTES
            )));
        }
        Ok(())
    }

    fn payload_len(&self) -> usize {
        match &self.payload {
            ProtocolPayload::None => 0,
            ProtocolPayload::WebSocket { subprotocol, .. } => subprotocol.len(),
            ProtocolPayload::Database {
                connection_string,
                query,
                driver,
            } => connection_string.len() + query.len() + driver.len(),
            ProtocolPayload::Mqtt {
                client_id,
                topic,
                payload,
                ..
            } => client_id.len() + topic.len() + payload.len(),
        }
    }
}

/// Parse a newline-delimited header blob into `(name, value)` pairs.
///
/// Lines without a colon are skipped. Names and values are trimmed.
pub fn parse_header_blob(blob: &str) -> Vec<(String, String)> {
    blob.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Look up a header value in a blob, case-insensitively.
pub fn header_from_blob<'a>(blob: &'a str, name: &str) -> Option<String> {
    parse_header_blob(blob)
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}
