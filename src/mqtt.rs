//! MQTT 3.1.1 packet framing and connection management.
//!
//! The adapter speaks the wire format directly over TCP: fixed header,
//! base-128 remaining-length field, length-prefixed UTF-8 strings. Each
//! `(host, port, client_id)` tuple owns one connection with a small state
//! machine: disconnected → connecting → connected → disconnecting →
//! disconnected; any error lands back in disconnected with `last_error`
//! populated.
//!
//! Acknowledgement handling is intentionally minimal: CONNECT treats any
//! bytes from the broker as the CONNACK, and PUBLISH at QoS > 0 is
//! optimistic — the packet id is allocated and the packet written, but no
//! PUBACK is awaited. SUBSCRIBE and UNSUBSCRIBE send real packets and are
//! best-effort: success is reported without waiting for SUBACK/UNSUBACK.

use crate::common::{Stopwatch, MQTT_POOL_CAPACITY, TCP_CONNECT_CEILING_MS};
use crate::errors::EngineError;
use crate::registry::ConnectionRegistry;
use crate::request::Protocol;
use crate::response::{ResponseRecord, Trailer};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Largest value representable by the 4-byte remaining-length field.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

// Fixed-header packet types.
const PKT_CONNECT: u8 = 0x10;
const PKT_PUBLISH: u8 = 0x30;
const PKT_SUBSCRIBE: u8 = 0x82;
const PKT_UNSUBSCRIBE: u8 = 0xA2;
const PKT_DISCONNECT: u8 = 0xE0;
const PKT_CONNACK: u8 = 0x20;

// CONNECT flag bits.
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// Encode `n` as the base-128 remaining-length field (1–4 bytes, high bit
/// as the continuation marker).
pub fn encode_remaining_length(mut n: u32) -> Result<Vec<u8>, EngineError> {
    if n > MAX_REMAINING_LENGTH {
        return Err(EngineError::ProtocolError(format!(
            "remaining length {n} exceeds {MAX_REMAINING_LENGTH}"
        )));
    }
    let mut out = Vec::with_capacity(4);
    loop {
        let mut byte = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
    Ok(out)
}

/// Decode a remaining-length field, returning `(value, bytes_consumed)`.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<(u32, usize), EngineError> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(EngineError::ProtocolError(
                "remaining length field longer than 4 bytes".to_string(),
            ));
        }
        value += (byte & 0x7F) as u32 * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }
    Err(EngineError::ProtocolError(
        "truncated remaining length field".to_string(),
    ))
}

/// Append a length-prefixed UTF-8 string.
fn push_utf8_string(buf: &mut Vec<u8>, s: &str) {
    let len = s.len() as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Build a CONNECT packet: protocol name "MQTT", level 4, clean session,
/// optional credentials, keep-alive in seconds.
pub fn connect_packet(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_s: u16,
) -> Result<Vec<u8>, EngineError> {
    let mut flags = FLAG_CLEAN_SESSION;
    if username.is_some() {
        flags |= FLAG_USERNAME;
    }
    if password.is_some() {
        flags |= FLAG_PASSWORD;
    }

    let mut var = Vec::new();
    push_utf8_string(&mut var, "MQTT");
    var.push(0x04);
    var.push(flags);
    var.extend_from_slice(&keep_alive_s.to_be_bytes());

    push_utf8_string(&mut var, client_id);
    if let Some(user) = username {
        push_utf8_string(&mut var, user);
    }
    if let Some(pass) = password {
        push_utf8_string(&mut var, pass);
    }

    let mut packet = vec![PKT_CONNECT];
    packet.extend(encode_remaining_length(var.len() as u32)?);
    packet.extend(var);
    Ok(packet)
}

/// Build a PUBLISH packet. `packet_id` must be present iff `qos > 0`.
pub fn publish_packet(
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
    packet_id: Option<u16>,
) -> Result<Vec<u8>, EngineError> {
    if qos > 2 {
        return Err(EngineError::InvalidArgument(format!("invalid QoS {qos}")));
    }
    if (qos > 0) != packet_id.is_some() {
        return Err(EngineError::InvalidArgument(
            "packet id required exactly when QoS > 0".to_string(),
        ));
    }

    let mut var = Vec::new();
    push_utf8_string(&mut var, topic);
    if let Some(id) = packet_id {
        var.extend_from_slice(&id.to_be_bytes());
    }
    var.extend_from_slice(payload);

    let fixed = PKT_PUBLISH | (qos << 1) | u8::from(retain);
    let mut packet = vec![fixed];
    packet.extend(encode_remaining_length(var.len() as u32)?);
    packet.extend(var);
    Ok(packet)
}

/// Build a SUBSCRIBE packet for one topic filter.
pub fn subscribe_packet(topic: &str, qos: u8, packet_id: u16) -> Result<Vec<u8>, EngineError> {
    let mut var = Vec::new();
    var.extend_from_slice(&packet_id.to_be_bytes());
    push_utf8_string(&mut var, topic);
    var.push(qos & 0x03);

    let mut packet = vec![PKT_SUBSCRIBE];
    packet.extend(encode_remaining_length(var.len() as u32)?);
    packet.extend(var);
    Ok(packet)
}

/// Build an UNSUBSCRIBE packet for one topic filter.
pub fn unsubscribe_packet(topic: &str, packet_id: u16) -> Result<Vec<u8>, EngineError> {
    let mut var = Vec::new();
    var.extend_from_slice(&packet_id.to_be_bytes());
    push_utf8_string(&mut var, topic);

    let mut packet = vec![PKT_UNSUBSCRIBE];
    packet.extend(encode_remaining_length(var.len() as u32)?);
    packet.extend(var);
    Ok(packet)
}

/// The two-byte DISCONNECT packet.
pub fn disconnect_packet() -> [u8; 2] {
    [PKT_DISCONNECT, 0x00]
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Live state for one broker connection.
pub struct MqttConnection {
    stream: Option<TcpStream>,
    state: MqttState,
    client_id: String,
    /// Monotonically increasing id for QoS > 0 packets; never 0.
    next_packet_id: u16,
    published_count: u64,
    received_count: u64,
    last_message: String,
    last_error: String,
}

impl MqttConnection {
    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    fn fail(&mut self, error: impl Into<String>) -> String {
        let error = error.into();
        self.state = MqttState::Disconnected;
        self.stream = None;
        self.last_error = error.clone();
        error
    }

    pub fn state(&self) -> MqttState {
        self.state
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    fn trailer(&self, topic: &str, qos: u8, retain: bool, publish_time_us: u64) -> Trailer {
        Trailer::Mqtt {
            message_published: publish_time_us > 0,
            message_received: self.received_count > 0,
            published_count: self.published_count,
            received_count: self.received_count,
            topic: topic.to_string(),
            last_message: self.last_message.clone(),
            qos_level: qos,
            retained: retain,
            publish_time_us,
        }
    }
}

/// MQTT adapter keyed by `(host, port, client_id)`.
pub struct MqttAdapter {
    registry: ConnectionRegistry<(String, u16, String), MqttConnection>,
}

impl MqttAdapter {
    pub fn new() -> Self {
        Self::with_capacity(MQTT_POOL_CAPACITY)
    }

    /// Soft ceiling from engine configuration; the per-protocol hard cap
    /// still applies.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new("mqtt", capacity.clamp(1, MQTT_POOL_CAPACITY)),
        }
    }

    /// Open the TCP transport, send CONNECT, and wait for broker bytes.
    ///
    /// Any bytes from the broker are treated as the CONNACK; a packet that
    /// does not start with 0x20 is logged but still accepted.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive_s: u16,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        if client_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "MQTT client id must not be empty".to_string(),
            ));
        }
        let key = (host.to_string(), port, client_id.to_string());

        if let Some(existing) = self.registry.get(&key) {
            let conn = existing.lock().await;
            if conn.state == MqttState::Connected {
                debug!(host, port, client_id, "MQTT already connected");
                return Ok(ResponseRecord::ok(Protocol::Mqtt, 200, stopwatch.elapsed_us())
                    .with_trailer(conn.trailer("", 0, false, 0)));
            }
            drop(conn);
            self.registry.remove(&key);
        }

        let entry = self.registry.insert(
            key.clone(),
            MqttConnection {
                stream: None,
                state: MqttState::Connecting,
                client_id: client_id.to_string(),
                next_packet_id: 1,
                published_count: 0,
                received_count: 0,
                last_message: String::new(),
                last_error: String::new(),
            },
        )?;
        let mut conn = entry.lock().await;

        let connect_deadline = timeout.min(Duration::from_millis(TCP_CONNECT_CEILING_MS));
        let mut stream =
            match tokio::time::timeout(connect_deadline, TcpStream::connect((host, port))).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    let msg = conn.fail(e.to_string());
                    drop(conn);
                    self.registry.remove(&key);
                    warn!(host, port, client_id, error = %msg, "MQTT transport connect failed");
                    return Ok(ResponseRecord::failed(
                        Protocol::Mqtt,
                        0,
                        stopwatch.elapsed_us(),
                        msg,
                    ));
                }
                Err(_) => {
                    let msg = conn.fail(format!("connect timed out after {connect_deadline:?}"));
                    drop(conn);
                    self.registry.remove(&key);
                    return Ok(ResponseRecord::failed(
                        Protocol::Mqtt,
                        408,
                        stopwatch.elapsed_us(),
                        msg,
                    ));
                }
            };

        let packet = connect_packet(client_id, username, password, keep_alive_s)?;
        if let Err(e) = stream.write_all(&packet).await {
            let msg = conn.fail(e.to_string());
            drop(conn);
            self.registry.remove(&key);
            return Ok(ResponseRecord::failed(
                Protocol::Mqtt,
                0,
                stopwatch.elapsed_us(),
                msg,
            ));
        }

        // Minimal acknowledgement: any broker bytes count as the CONNACK.
        let mut ack = [0u8; 4];
        match tokio::time::timeout(timeout, stream.read(&mut ack)).await {
            Ok(Ok(n)) if n > 0 => {
                if ack[0] != PKT_CONNACK {
                    debug!(host, port, first_byte = ack[0], "Unexpected packet in place of CONNACK");
                }
                conn.received_count += 1;
                conn.stream = Some(stream);
                conn.state = MqttState::Connected;
                info!(host, port, client_id, "MQTT connected");
                Ok(ResponseRecord::ok(Protocol::Mqtt, 200, stopwatch.elapsed_us())
                    .with_trailer(conn.trailer("", 0, false, 0)))
            }
            Ok(Ok(_)) => {
                let msg = conn.fail("broker closed during CONNECT");
                drop(conn);
                self.registry.remove(&key);
                Ok(ResponseRecord::failed(
                    Protocol::Mqtt,
                    0,
                    stopwatch.elapsed_us(),
                    msg,
                ))
            }
            Ok(Err(e)) => {
                let msg = conn.fail(e.to_string());
                drop(conn);
                self.registry.remove(&key);
                Ok(ResponseRecord::failed(
                    Protocol::Mqtt,
                    0,
                    stopwatch.elapsed_us(),
                    msg,
                ))
            }
            Err(_) => {
                let msg = conn.fail(format!("no CONNACK within {timeout:?}"));
                drop(conn);
                self.registry.remove(&key);
                Ok(ResponseRecord::failed(
                    Protocol::Mqtt,
                    408,
                    stopwatch.elapsed_us(),
                    msg,
                ))
            }
        }
    }

    /// Publish one message.
    ///
    /// Optimistic at QoS > 0: a packet id is allocated from the
    /// per-connection counter and the packet written, but no PUBACK is
    /// awaited before success is reported.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        if topic.is_empty() {
            return Err(EngineError::InvalidArgument(
                "MQTT topic must not be empty".to_string(),
            ));
        }
        let key = (host.to_string(), port, client_id.to_string());
        let entry = self
            .registry
            .get(&key)
            .ok_or_else(|| EngineError::NotConnected(format!("mqtt {client_id}@{host}:{port}")))?;

        let mut conn = entry.lock().await;
        if conn.state != MqttState::Connected {
            return Err(EngineError::NotConnected(format!(
                "mqtt {client_id}@{host}:{port}"
            )));
        }

        let packet_id = (qos > 0).then(|| conn.allocate_packet_id());
        let packet = publish_packet(topic, payload.as_bytes(), qos, retain, packet_id)?;

        let Some(stream) = conn.stream.as_mut() else {
            return Err(EngineError::NotConnected(format!(
                "mqtt {client_id}@{host}:{port}"
            )));
        };
        match stream.write_all(&packet).await {
            Ok(()) => {
                conn.published_count += 1;
                conn.last_message = payload.to_string();
                let publish_time_us = stopwatch.elapsed_us();
                debug!(
                    host,
                    port,
                    client_id,
                    topic,
                    qos,
                    packet_id = packet_id.unwrap_or(0),
                    "MQTT published"
                );
                Ok(ResponseRecord::ok(Protocol::Mqtt, 200, publish_time_us)
                    .with_trailer(conn.trailer(topic, qos, retain, publish_time_us)))
            }
            Err(e) => {
                let msg = conn.fail(e.to_string());
                warn!(host, port, client_id, error = %msg, "MQTT publish failed");
                Ok(ResponseRecord::failed(
                    Protocol::Mqtt,
                    0,
                    stopwatch.elapsed_us(),
                    msg,
                ))
            }
        }
    }

    /// Send a SUBSCRIBE packet. Best-effort: no SUBACK wait.
    pub async fn subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: u8,
    ) -> Result<ResponseRecord, EngineError> {
        self.send_control(host, port, client_id, topic, move |id| {
            subscribe_packet(topic, qos, id)
        })
        .await
    }

    /// Send an UNSUBSCRIBE packet. Best-effort: no UNSUBACK wait.
    pub async fn unsubscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
    ) -> Result<ResponseRecord, EngineError> {
        self.send_control(host, port, client_id, topic, move |id| {
            unsubscribe_packet(topic, id)
        })
        .await
    }

    async fn send_control(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        build: impl FnOnce(u16) -> Result<Vec<u8>, EngineError>,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let key = (host.to_string(), port, client_id.to_string());
        let entry = self
            .registry
            .get(&key)
            .ok_or_else(|| EngineError::NotConnected(format!("mqtt {client_id}@{host}:{port}")))?;

        let mut conn = entry.lock().await;
        if conn.state != MqttState::Connected {
            return Err(EngineError::NotConnected(format!(
                "mqtt {client_id}@{host}:{port}"
            )));
        }

        let id = conn.allocate_packet_id();
        let packet = build(id)?;
        let Some(stream) = conn.stream.as_mut() else {
            return Err(EngineError::NotConnected(format!(
                "mqtt {client_id}@{host}:{port}"
            )));
        };
        match stream.write_all(&packet).await {
            Ok(()) => {
                debug!(host, port, client_id, topic, packet_id = id, "MQTT control packet sent");
                Ok(ResponseRecord::ok(Protocol::Mqtt, 200, stopwatch.elapsed_us())
                    .with_trailer(conn.trailer(topic, 0, false, 0)))
            }
            Err(e) => {
                let msg = conn.fail(e.to_string());
                Ok(ResponseRecord::failed(
                    Protocol::Mqtt,
                    0,
                    stopwatch.elapsed_us(),
                    msg,
                ))
            }
        }
    }

    /// Send DISCONNECT and drop the connection. Idempotent.
    pub async fn disconnect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
    ) -> Result<ResponseRecord, EngineError> {
        let stopwatch = Stopwatch::start();
        let key = (host.to_string(), port, client_id.to_string());

        if let Some(entry) = self.registry.remove(&key) {
            let mut conn = entry.lock().await;
            conn.state = MqttState::Disconnecting;
            if let Some(stream) = conn.stream.as_mut() {
                if let Err(e) = stream.write_all(&disconnect_packet()).await {
                    debug!(host, port, client_id, error = %e, "DISCONNECT write failed");
                }
                let _ = stream.shutdown().await;
            }
            conn.state = MqttState::Disconnected;
            conn.stream = None;
            info!(host, port, client_id = %conn.client_id, "MQTT disconnected");
        }

        Ok(ResponseRecord::ok(Protocol::Mqtt, 200, stopwatch.elapsed_us()))
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn clear(&self) {
        self.registry.clear();
    }
}

impl Default for MqttAdapter {
    fn default() -> Self {
        Self::new()
    }
}
