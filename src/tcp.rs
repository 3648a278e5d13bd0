//! Raw TCP connection management.
//!
//! Connects resolve the host and wait for readiness under a 5 s ceiling;
//! receives wait up to 1 s and report an idle socket as a normal empty
//! outcome (status 204), not an error. A peer close during receive yields
//! status 410 and marks the entry disconnected.

use crate::common::{
    Stopwatch, MAX_BODY_BYTES, RECEIVE_WAIT_MS, TCP_CONNECT_CEILING_MS, TCP_POOL_CAPACITY,
};
use crate::errors::EngineError;
use crate::registry::ConnectionRegistry;
use crate::request::Protocol;
use crate::response::{ResponseRecord, Trailer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Live state for one TCP endpoint.
pub struct TcpConnection {
    stream: TcpStream,
    socket_id: u64,
    connected: bool,
    last_error: String,
    bytes_sent: u64,
    bytes_received: u64,
    connect_time_us: u64,
}

impl TcpConnection {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    fn trailer(&self) -> Trailer {
        Trailer::Tcp {
            socket_id: self.socket_id,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            connect_time_us: self.connect_time_us,
        }
    }
}

/// TCP adapter keyed by `(host, port)`.
pub struct TcpAdapter {
    registry: ConnectionRegistry<(String, u16), TcpConnection>,
    next_socket_id: AtomicU64,
}

impl TcpAdapter {
    pub fn new() -> Self {
        Self::with_capacity(TCP_POOL_CAPACITY)
    }

    /// Soft ceiling from engine configuration; the per-protocol hard cap
    /// still applies.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new("tcp", capacity.clamp(1, TCP_POOL_CAPACITY)),
            next_socket_id: AtomicU64::new(1),
        }
    }

    /// Resolve and connect with the 5 s ceiling, registering the entry.
    pub async fn connect(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let key = (host.to_string(), port);

        if let Some(existing) = self.registry.get(&key) {
            let conn = existing.lock().await;
            if conn.connected {
                debug!(host, port, "TCP endpoint already connected");
                return Ok(ResponseRecord::ok(Protocol::Tcp, 200, stopwatch.elapsed_us())
                    .with_trailer(conn.trailer()));
            }
            // Stale entry from a previous peer close; replace it.
            drop(conn);
            self.registry.remove(&key);
        }

        let deadline = Duration::from_millis(TCP_CONNECT_CEILING_MS);
        let stream = match tokio::time::timeout(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(host, port, error = %e, "TCP connect failed");
                return Ok(ResponseRecord::failed(
                    Protocol::Tcp,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                ));
            }
            Err(_) => {
                return Ok(ResponseRecord::failed(
                    Protocol::Tcp,
                    408,
                    stopwatch.elapsed_us(),
                    format!("connect timed out after {deadline:?}"),
                ));
            }
        };

        let connect_time_us = stopwatch.elapsed_us();
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let conn = TcpConnection {
            stream,
            socket_id,
            connected: true,
            last_error: String::new(),
            bytes_sent: 0,
            bytes_received: 0,
            connect_time_us,
        };
        let entry = self.registry.insert(key, conn)?;

        info!(host, port, socket_id, connect_time_us, "TCP connected");
        let conn = entry.lock().await;
        Ok(ResponseRecord::ok(Protocol::Tcp, 200, stopwatch.elapsed_us())
            .with_trailer(conn.trailer()))
    }

    /// Send raw bytes on an established connection.
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        data: &[u8],
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .get(&(host.to_string(), port))
            .ok_or_else(|| EngineError::NotConnected(format!("tcp://{host}:{port}")))?;

        let mut conn = entry.lock().await;
        if !conn.connected {
            return Err(EngineError::NotConnected(format!("tcp://{host}:{port}")));
        }

        match conn.stream.write_all(data).await {
            Ok(()) => {
                conn.bytes_sent += data.len() as u64;
                debug!(host, port, bytes = data.len(), "TCP sent");
                Ok(ResponseRecord::ok(Protocol::Tcp, 200, stopwatch.elapsed_us())
                    .with_trailer(conn.trailer()))
            }
            Err(e) => {
                conn.connected = false;
                conn.last_error = e.to_string();
                warn!(host, port, error = %e, "TCP send failed");
                Ok(ResponseRecord::failed(
                    Protocol::Tcp,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                )
                .with_trailer(conn.trailer()))
            }
        }
    }

    /// Wait up to 1 s for data.
    ///
    /// No data within the deadline is a normal outcome: success with
    /// status 204 and an empty body. A peer close returns status 410 and
    /// marks the entry disconnected.
    pub async fn receive(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .get(&(host.to_string(), port))
            .ok_or_else(|| EngineError::NotConnected(format!("tcp://{host}:{port}")))?;

        let mut conn = entry.lock().await;
        if !conn.connected {
            return Err(EngineError::NotConnected(format!("tcp://{host}:{port}")));
        }

        let mut buf = vec![0u8; MAX_BODY_BYTES];
        let wait = Duration::from_millis(RECEIVE_WAIT_MS);
        match tokio::time::timeout(wait, conn.stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                conn.connected = false;
                conn.last_error = "peer closed connection".to_string();
                info!(host, port, "TCP peer closed");
                Ok(ResponseRecord::failed(
                    Protocol::Tcp,
                    410,
                    stopwatch.elapsed_us(),
                    "peer closed connection",
                )
                .with_trailer(conn.trailer()))
            }
            Ok(Ok(n)) => {
                conn.bytes_received += n as u64;
                debug!(host, port, bytes = n, "TCP received");
                let body = String::from_utf8_lossy(&buf[..n]).into_owned();
                Ok(ResponseRecord::ok(Protocol::Tcp, 200, stopwatch.elapsed_us())
                    .with_body(body)
                    .with_trailer(conn.trailer()))
            }
            Ok(Err(e)) => {
                conn.connected = false;
                conn.last_error = e.to_string();
                warn!(host, port, error = %e, "TCP receive failed");
                Ok(ResponseRecord::failed(
                    Protocol::Tcp,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                )
                .with_trailer(conn.trailer()))
            }
            Err(_) => Ok(ResponseRecord::ok(Protocol::Tcp, 204, stopwatch.elapsed_us())
                .with_trailer(conn.trailer())),
        }
    }

    /// Close and forget an endpoint. Idempotent.
    pub async fn disconnect(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        if let Some(entry) = self.registry.remove(&(host.to_string(), port)) {
            let mut conn = entry.lock().await;
            conn.connected = false;
            let _ = conn.stream.shutdown().await;
            info!(host, port, socket_id = conn.socket_id, "TCP disconnected");
        }
        Ok(ResponseRecord::ok(Protocol::Tcp, 200, stopwatch.elapsed_us()))
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn clear(&self) {
        self.registry.clear();
    }
}

impl Default for TcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}
