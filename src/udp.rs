//! UDP endpoint management and datagram exchange.
//!
//! Sockets are created through `socket2` so `SO_REUSEADDR` is set before
//! the ephemeral bind, then handed to tokio. Sends resolve the destination
//! and fire in one call, auto-creating the endpoint when absent; receives
//! wait up to 1 s and report a quiet socket as status 204.

use crate::common::{Stopwatch, MAX_BODY_BYTES, RECEIVE_WAIT_MS, UDP_POOL_CAPACITY};
use crate::errors::EngineError;
use crate::registry::ConnectionRegistry;
use crate::request::Protocol;
use crate::response::{ResponseRecord, Trailer};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Live state for one UDP endpoint.
pub struct UdpEndpoint {
    socket: UdpSocket,
    socket_id: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl UdpEndpoint {
    fn trailer(&self, remote_host: String, remote_port: u16) -> Trailer {
        Trailer::Udp {
            socket_id: self.socket_id,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            remote_host,
            remote_port,
        }
    }
}

/// UDP adapter keyed by destination `(host, port)`.
pub struct UdpAdapter {
    registry: ConnectionRegistry<(String, u16), UdpEndpoint>,
    next_socket_id: AtomicU64,
}

impl UdpAdapter {
    pub fn new() -> Self {
        Self::with_capacity(UDP_POOL_CAPACITY)
    }

    /// Soft ceiling from engine configuration; the per-protocol hard cap
    /// still applies.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new("udp", capacity.clamp(1, UDP_POOL_CAPACITY)),
            next_socket_id: AtomicU64::new(1),
        }
    }

    fn new_socket() -> Result<UdpSocket, EngineError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))
            .map_err(|e| EngineError::TransportFailed(format!("socket create failed: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| EngineError::TransportFailed(format!("SO_REUSEADDR failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| EngineError::TransportFailed(format!("nonblocking failed: {e}")))?;

        // Ephemeral bind; the same socket serves sends and receives.
        let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        socket
            .bind(&any.into())
            .map_err(|e| EngineError::TransportFailed(format!("bind failed: {e}")))?;

        UdpSocket::from_std(socket.into())
            .map_err(|e| EngineError::TransportFailed(format!("tokio adoption failed: {e}")))
    }

    /// Allocate the endpoint's socket ahead of time.
    pub async fn create_endpoint(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self.endpoint_entry(host, port)?;
        let ep = entry.lock().await;

        info!(host, port, socket_id = ep.socket_id, "UDP endpoint ready");
        Ok(ResponseRecord::ok(Protocol::Udp, 200, stopwatch.elapsed_us())
            .with_trailer(ep.trailer(host.to_string(), port)))
    }

    fn endpoint_entry(
        &self,
        host: &str,
        port: u16,
    ) -> Result<crate::registry::Entry<UdpEndpoint>, EngineError> {
        let key = (host.to_string(), port);
        if let Some(existing) = self.registry.get(&key) {
            return Ok(existing);
        }
        let socket = Self::new_socket()?;
        let ep = UdpEndpoint {
            socket,
            socket_id: self.next_socket_id.fetch_add(1, Ordering::Relaxed),
            bytes_sent: 0,
            bytes_received: 0,
        };
        self.registry.insert(key, ep)
    }

    /// Resolve the destination and send one datagram, auto-creating the
    /// endpoint when absent.
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        data: &[u8],
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self.endpoint_entry(host, port)?;
        let mut ep = entry.lock().await;

        let target = format!("{host}:{port}");
        match ep.socket.send_to(data, &target).await {
            Ok(n) => {
                ep.bytes_sent += n as u64;
                debug!(host, port, bytes = n, "UDP datagram sent");
                Ok(ResponseRecord::ok(Protocol::Udp, 200, stopwatch.elapsed_us())
                    .with_trailer(ep.trailer(host.to_string(), port)))
            }
            Err(e) => {
                warn!(host, port, error = %e, "UDP send failed");
                Ok(ResponseRecord::failed(
                    Protocol::Udp,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                )
                .with_trailer(ep.trailer(host.to_string(), port)))
            }
        }
    }

    /// Wait up to 1 s for a datagram on the endpoint's socket.
    ///
    /// The sender's address and port are captured in the trailer; a quiet
    /// socket is a normal outcome (status 204, empty body).
    pub async fn receive(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let entry = self
            .registry
            .get(&(host.to_string(), port))
            .ok_or_else(|| EngineError::NotConnected(format!("udp://{host}:{port}")))?;

        let mut ep = entry.lock().await;
        let mut buf = vec![0u8; MAX_BODY_BYTES];
        let wait = Duration::from_millis(RECEIVE_WAIT_MS);

        match tokio::time::timeout(wait, ep.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                ep.bytes_received += n as u64;
                debug!(host, port, bytes = n, from = %from, "UDP datagram received");
                let body = String::from_utf8_lossy(&buf[..n]).into_owned();
                Ok(ResponseRecord::ok(Protocol::Udp, 200, stopwatch.elapsed_us())
                    .with_body(body)
                    .with_trailer(ep.trailer(from.ip().to_string(), from.port())))
            }
            Ok(Err(e)) => {
                warn!(host, port, error = %e, "UDP receive failed");
                Ok(ResponseRecord::failed(
                    Protocol::Udp,
                    0,
                    stopwatch.elapsed_us(),
                    e.to_string(),
                )
                .with_trailer(ep.trailer(host.to_string(), port)))
            }
            Err(_) => Ok(ResponseRecord::ok(Protocol::Udp, 204, stopwatch.elapsed_us())
                .with_trailer(ep.trailer(host.to_string(), port))),
        }
    }

    /// Drop an endpoint. Idempotent.
    pub async fn close(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        if self.registry.remove(&(host.to_string(), port)).is_some() {
            info!(host, port, "UDP endpoint closed");
        }
        Ok(ResponseRecord::ok(Protocol::Udp, 200, stopwatch.elapsed_us()))
    }

    pub fn endpoint_count(&self) -> usize {
        self.registry.len()
    }

    pub fn clear(&self) {
        self.registry.clear();
    }
}

impl Default for UdpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_endpoint_and_close_idempotent() {
        let adapter = UdpAdapter::new();

        let rec = adapter.create_endpoint("127.0.0.1", 9999).await.unwrap();
        assert!(rec.success);
        assert_eq!(adapter.endpoint_count(), 1);

        adapter.close("127.0.0.1", 9999).await.unwrap();
        let rec = adapter.close("127.0.0.1", 9999).await.unwrap();
        assert!(rec.success);
        assert_eq!(adapter.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_requires_endpoint() {
        let adapter = UdpAdapter::new();
        let err = adapter.receive("127.0.0.1", 9999).await.unwrap_err();
        assert!(matches!(err, EngineError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_send_auto_creates_endpoint() {
        let adapter = UdpAdapter::new();
        // Fire-and-forget datagram at a local port nobody listens on;
        // UDP send itself succeeds.
        let rec = adapter.send("127.0.0.1", 9998, b"hello").await.unwrap();
        assert!(rec.success);
        assert_eq!(adapter.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let adapter = UdpAdapter::new();
        let rec = adapter
            .send("127.0.0.1", echo_addr.port(), b"ping")
            .await
            .unwrap();
        assert!(rec.success);

        let rec = adapter.receive("127.0.0.1", echo_addr.port()).await.unwrap();
        assert!(rec.success);
        assert_eq!(rec.status_code, 200);
        assert_eq!(rec.body, "ping");
        match rec.trailer {
            Trailer::Udp {
                remote_port,
                bytes_received,
                ..
            } => {
                assert_eq!(remote_port, echo_addr.port());
                assert_eq!(bytes_received, 4);
            }
            _ => panic!("expected UDP trailer"),
        }
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_204() {
        let adapter = UdpAdapter::new();
        adapter.create_endpoint("127.0.0.1", 9997).await.unwrap();

        let rec = adapter.receive("127.0.0.1", 9997).await.unwrap();
        assert!(rec.success);
        assert_eq!(rec.status_code, 204);
        assert!(rec.body.is_empty());
    }
}
