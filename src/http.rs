//! HTTP request execution.
//!
//! One shared `reqwest` client (rustls, redirects capped at 5) executes
//! descriptors synchronously from the caller's point of view. Headers and
//! body are captured into bounded buffers; past the bound the body is still
//! drained chunk by chunk so the connection can be reused without buffering
//! the full payload in memory.

use crate::common::{append_bounded, Stopwatch, HTTP_POOL_CAPACITY, MAX_BODY_BYTES, MAX_HEADER_BYTES};
use crate::errors::{EngineError, ErrorCategory};
use crate::request::{parse_header_blob, Protocol, RequestDescriptor};
use crate::response::ResponseRecord;
use tracing::{debug, warn};

/// HTTP adapter wrapping a shared connection-pooled client.
///
/// There is no separate HTTP registry: reqwest manages the pool. The
/// engine's `max_connections` bounds the idle connections kept per host,
/// clamped to the HTTP capacity cap.
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(max_connections: usize) -> Result<Self, EngineError> {
        let idle_per_host = max_connections.clamp(1, HTTP_POOL_CAPACITY);
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .pool_max_idle_per_host(idle_per_host)
            .build()
            .map_err(|e| EngineError::InvalidArgument(format!("HTTP client build failed: {e}")))?;

        Ok(Self { client })
    }

    /// Execute one HTTP request and capture the bounded response.
    ///
    /// `success` is transport-ok AND `200 <= status < 400`. Transport
    /// failures produce `status_code = 0` with the transport error text;
    /// timing is populated in every case.
    pub async fn execute(&self, request: &RequestDescriptor) -> ResponseRecord {
        let stopwatch = Stopwatch::start();

        let mut builder = match self.build_request(request) {
            Ok(b) => b,
            Err(msg) => {
                return ResponseRecord::failed(Protocol::Http, 400, stopwatch.elapsed_us(), msg);
            }
        };
        builder = builder.timeout(request.timeout);

        debug!(method = %request.method, url = %request.url, "Sending HTTP request");

        let mut response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                let elapsed = stopwatch.elapsed_us();
                let category = ErrorCategory::from_reqwest_error(&e);
                warn!(url = %request.url, error = %e, category = %category, "HTTP request failed");
                return ResponseRecord::failed(Protocol::Http, 0, elapsed, e.to_string());
            }
        };

        let status = response.status().as_u16();
        let headers = capture_headers(response.headers());

        // Stream the body into a bounded buffer, then keep draining so the
        // pooled connection is left in a reusable state.
        let mut body_buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut read_error = None;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let taken = append_bounded(&mut body_buf, &chunk, MAX_BODY_BYTES);
                    if taken < chunk.len() {
                        truncated = true;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(e.to_string());
                    break;
                }
            }
        }

        let elapsed = stopwatch.elapsed_us();
        let body = String::from_utf8_lossy(&body_buf).into_owned();

        if truncated {
            debug!(url = %request.url, captured = body_buf.len(), "Body truncated at capture bound");
        }

        match read_error {
            Some(msg) => {
                warn!(url = %request.url, error = %msg, "Failed to read response body");
                let mut record =
                    ResponseRecord::failed(Protocol::Http, status, elapsed, msg);
                record.headers = headers;
                record.body = body;
                record
            }
            None => {
                let success = (200..400).contains(&status);
                let mut record = if success {
                    ResponseRecord::ok(Protocol::Http, status, elapsed)
                } else {
                    ResponseRecord::failed(
                        Protocol::Http,
                        status,
                        elapsed,
                        format!("HTTP {status}"),
                    )
                };
                record.headers = headers;
                record.body = body;
                record
            }
        }
    }

    fn build_request(&self, request: &RequestDescriptor) -> Result<reqwest::RequestBuilder, String> {
        let mut builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "PATCH" => self.client.patch(&request.url),
            "DELETE" => self.client.delete(&request.url),
            "HEAD" => self.client.head(&request.url),
            "OPTIONS" => self.client.request(reqwest::Method::OPTIONS, &request.url),
            other => return Err(format!("unsupported HTTP method: {other}")),
        };

        for (name, value) in parse_header_blob(&request.headers) {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        Ok(builder)
    }
}

/// Flatten a reqwest header map into the newline-delimited blob form,
/// truncated to the header bound.
fn capture_headers(headers: &reqwest::header::HeaderMap) -> String {
    let mut blob = String::new();
    for (name, value) in headers {
        let line = format!("{}: {}\n", name, value.to_str().unwrap_or(""));
        if blob.len() + line.len() > MAX_HEADER_BYTES {
            break;
        }
        blob.push_str(&line);
    }
    blob
}
