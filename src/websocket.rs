//! WebSocket connection management.
//!
//! Real RFC 6455 handshake and framing via `tokio-tungstenite`. Each
//! connected URL keeps a context in a bounded registry; `send` and `close`
//! require the context to exist, `connect` is idempotent on an
//! already-connected URL.

use crate::common::{truncate_utf8, Stopwatch, MAX_BODY_BYTES, WEBSOCKET_POOL_CAPACITY};
use crate::errors::EngineError;
use crate::registry::ConnectionRegistry;
use crate::request::Protocol;
use crate::response::{ResponseRecord, Trailer};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live connection context for one WebSocket URL.
pub struct WsContext {
    stream: WsStream,
    subprotocol: String,
    ping_interval: Option<Duration>,
    last_ping: Instant,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl WsContext {
    fn trailer(&self) -> Trailer {
        Trailer::WebSocket {
            subprotocol: self.subprotocol.clone(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

/// WebSocket adapter: connect / send / close keyed by URL.
pub struct WebSocketAdapter {
    registry: ConnectionRegistry<String, WsContext>,
}

impl WebSocketAdapter {
    pub fn new() -> Self {
        Self::with_capacity(WEBSOCKET_POOL_CAPACITY)
    }

    /// Soft ceiling from engine configuration; the per-protocol hard cap
    /// still applies.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(
                "websocket",
                capacity.clamp(1, WEBSOCKET_POOL_CAPACITY),
            ),
        }
    }

    /// Perform the Upgrade handshake and register the connection.
    ///
    /// Connecting a URL that already has a live context is a no-op success
    /// (status 101, current counters in the trailer).
    pub async fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        ping_interval: Option<Duration>,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();

        if let Some(existing) = self.registry.get(&url.to_string()) {
            let ctx = existing.lock().await;
            debug!(url, "WebSocket already connected");
            return Ok(ResponseRecord::ok(Protocol::WebSocket, 101, stopwatch.elapsed_us())
                .with_trailer(ctx.trailer()));
        }

        let mut handshake = url
            .into_client_request()
            .map_err(|e| EngineError::InvalidArgument(format!("bad WebSocket URL: {e}")))?;
        if !subprotocol.is_empty() {
            let value = subprotocol
                .parse()
                .map_err(|_| EngineError::InvalidArgument("bad subprotocol value".to_string()))?;
            handshake
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let connect = tokio_tungstenite::connect_async(handshake);
        let (stream, response) = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(url, error = %e, "WebSocket handshake failed");
                return Ok(ResponseRecord::failed(
                    Protocol::WebSocket,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                ));
            }
            Err(_) => {
                return Ok(ResponseRecord::failed(
                    Protocol::WebSocket,
                    408,
                    stopwatch.elapsed_us(),
                    format!("handshake timed out after {timeout:?}"),
                ));
            }
        };

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(subprotocol)
            .to_string();

        let ctx = WsContext {
            stream,
            subprotocol: negotiated.clone(),
            ping_interval,
            last_ping: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        };
        let entry = self.registry.insert(url.to_string(), ctx)?;

        info!(url, subprotocol = %negotiated, "WebSocket connected");
        let ctx = entry.lock().await;
        Ok(ResponseRecord::ok(Protocol::WebSocket, 101, stopwatch.elapsed_us())
            .with_trailer(ctx.trailer()))
    }

    /// Send a text message on an established connection.
    pub async fn send(
        &self,
        url: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .get(&url.to_string())
            .ok_or_else(|| EngineError::NotConnected(url.to_string()))?;

        let mut ctx = entry.lock().await;

        // Keep-alive ping when the configured cadence has elapsed.
        if let Some(interval) = ctx.ping_interval {
            if ctx.last_ping.elapsed() >= interval {
                if let Err(e) = ctx.stream.send(Message::Ping(Vec::new())).await {
                    debug!(url, error = %e, "WebSocket ping failed");
                }
                ctx.last_ping = Instant::now();
            }
        }

        let frame = Message::Text(message.to_string());
        let sent = tokio::time::timeout(timeout, ctx.stream.send(frame)).await;
        match sent {
            Ok(Ok(())) => {
                ctx.messages_sent += 1;
                ctx.bytes_sent += message.len() as u64;
                debug!(url, bytes = message.len(), "WebSocket message sent");
                Ok(ResponseRecord::ok(Protocol::WebSocket, 200, stopwatch.elapsed_us())
                    .with_trailer(ctx.trailer()))
            }
            Ok(Err(e)) => {
                warn!(url, error = %e, "WebSocket send failed");
                let record = ResponseRecord::failed(
                    Protocol::WebSocket,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                )
                .with_trailer(ctx.trailer());
                drop(ctx);
                self.registry.remove(&url.to_string());
                Ok(record)
            }
            Err(_) => Ok(ResponseRecord::failed(
                Protocol::WebSocket,
                408,
                stopwatch.elapsed_us(),
                format!("send timed out after {timeout:?}"),
            )
            .with_trailer(ctx.trailer())),
        }
    }

    /// Receive the next text/binary message, if one arrives within the
    /// deadline. Status 204 with an empty body when nothing arrives.
    pub async fn receive(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .get(&url.to_string())
            .ok_or_else(|| EngineError::NotConnected(url.to_string()))?;

        let mut ctx = entry.lock().await;
        match tokio::time::timeout(timeout, ctx.stream.next()).await {
            Ok(Some(Ok(msg))) => {
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
                    other => {
                        debug!(url, frame = ?other, "Ignoring control frame");
                        String::new()
                    }
                };
                ctx.messages_received += 1;
                ctx.bytes_received += text.len() as u64;
                let body = truncate_utf8(&text, MAX_BODY_BYTES).to_string();
                Ok(ResponseRecord::ok(Protocol::WebSocket, 200, stopwatch.elapsed_us())
                    .with_body(body)
                    .with_trailer(ctx.trailer()))
            }
            Ok(Some(Err(e))) => Ok(ResponseRecord::failed(
                Protocol::WebSocket,
                0,
                stopwatch.elapsed_us(),
                e.to_string(),
            )
            .with_trailer(ctx.trailer())),
            Ok(None) => {
                let record = ResponseRecord::failed(
                    Protocol::WebSocket,
                    410,
                    stopwatch.elapsed_us(),
                    "peer closed connection",
                )
                .with_trailer(ctx.trailer());
                drop(ctx);
                self.registry.remove(&url.to_string());
                Ok(record)
            }
            Err(_) => Ok(ResponseRecord::ok(Protocol::WebSocket, 204, stopwatch.elapsed_us())
                .with_trailer(ctx.trailer())),
        }
    }

    /// Close an established connection and drop its context.
    pub async fn close(&self, url: &str) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .remove(&url.to_string())
            .ok_or_else(|| EngineError::NotConnected(url.to_string()))?;

        let mut ctx = entry.lock().await;
        if let Err(e) = ctx.stream.close(None).await {
            debug!(url, error = %e, "WebSocket close handshake failed");
        }
        info!(url, "WebSocket closed");

        Ok(ResponseRecord::ok(Protocol::WebSocket, 200, stopwatch.elapsed_us())
            .with_trailer(ctx.trailer()))
    }

    /// Number of live contexts.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop all contexts without a close handshake. Teardown only.
    pub fn clear(&self) {
        self.registry.clear();
    }
}

impl Default for WebSocketAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let adapter = WebSocketAdapter::new();
        let err = adapter
            .send("ws://127.0.0.1:9/none", "hi", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_close_requires_connection() {
        let adapter = WebSocketAdapter::new();
        let err = adapter.close("ws://127.0.0.1:9/none").await.unwrap_err();
        assert!(matches!(err, EngineError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_failure() {
        let adapter = WebSocketAdapter::new();
        // Port 9 (discard) is almost certainly closed; expect a failed
        // record rather than an Err: the transport was attempted.
        let record = adapter
            .connect("ws://127.0.0.1:9/ws", "", None, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!record.success);
        assert!(!record.error_message.is_empty());
        assert_eq!(adapter.connection_count(), 0);
    }
}
