//! The load-execution engine: protocol dispatch and shared state.
//!
//! An [`Engine`] owns every piece of cross-cutting state — the per-protocol
//! connection registries (inside their adapters), the metrics aggregator,
//! the percentile tracker and the session manager. Nothing is process-wide:
//! tests and drivers build as many independent engines as they need.
//!
//! Every public operation credits the metrics aggregator exactly once.
//! Programming faults (bad input, capacity) return `Err` and advance
//! nothing; transport failures come back as `success = false` records and
//! are credited like any other sample.

use crate::database::{DatabaseAdapter, DatabaseDriver};
use crate::errors::EngineError;
use crate::http::HttpAdapter;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::mqtt::MqttAdapter;
use crate::percentiles::{PercentileStats, PercentileTracker};
use crate::request::{Protocol, ProtocolPayload, RequestDescriptor};
use crate::response::ResponseRecord;
use crate::session::SessionManager;
use crate::tcp::TcpAdapter;
use crate::udp::UdpAdapter;
use crate::websocket::WebSocketAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Engine-level configuration consumed from the external front end.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Soft ceiling for in-flight work; sizes the worker-pool queue.
    /// Per-protocol registry hard caps still apply.
    pub max_connections: usize,

    /// Number of workers the pool runs; also scales the derived
    /// per-worker-second throughput in snapshots.
    pub worker_count: usize,

    /// Deadline applied when a descriptor carries none.
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            worker_count: 10,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Protocol dispatch and adapter ownership.
pub struct Engine {
    config: EngineConfig,
    metrics: MetricsAggregator,
    percentiles: PercentileTracker,
    sessions: SessionManager,
    http: HttpAdapter,
    websocket: WebSocketAdapter,
    tcp: TcpAdapter,
    udp: UdpAdapter,
    mqtt: MqttAdapter,
    database: DatabaseAdapter,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_database_driver(config, None)
    }

    /// Engine with a custom database back end instead of the simulated
    /// default.
    pub fn with_database_driver(
        config: EngineConfig,
        driver: Option<Arc<dyn DatabaseDriver>>,
    ) -> Result<Self, EngineError> {
        // max_connections is a soft ceiling across every registry; each
        // adapter clamps it to its per-protocol hard cap.
        let soft_cap = config.max_connections.max(1);
        let database = match driver {
            Some(d) => DatabaseAdapter::with_driver(d, soft_cap),
            None => DatabaseAdapter::with_driver(Arc::new(crate::database::SimulatedDriver), soft_cap),
        };
        let engine = Self {
            metrics: MetricsAggregator::new(config.worker_count),
            percentiles: PercentileTracker::new(),
            sessions: SessionManager::new(),
            http: HttpAdapter::new(soft_cap)?,
            websocket: WebSocketAdapter::with_capacity(soft_cap),
            tcp: TcpAdapter::with_capacity(soft_cap),
            udp: UdpAdapter::with_capacity(soft_cap),
            mqtt: MqttAdapter::with_capacity(soft_cap),
            database,
            config,
        };
        info!(
            workers = engine.config.worker_count,
            max_connections = engine.config.max_connections,
            "Engine initialised"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn percentile_stats(&self) -> PercentileStats {
        self.percentiles.stats()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
        self.percentiles.reset();
    }

    /// Map a URL scheme to its adapter. Case-insensitive prefix match;
    /// anything unrecognised is HTTP. MQTT has no scheme mapping — it is
    /// dispatched by explicit method only.
    pub fn detect_protocol(url: &str) -> Protocol {
        let lower = url.to_ascii_lowercase();
        const SCHEMES: &[(&str, Protocol)] = &[
            ("ws://", Protocol::WebSocket),
            ("wss://", Protocol::WebSocket),
            ("tcp://", Protocol::Tcp),
            ("udp://", Protocol::Udp),
            ("mysql://", Protocol::Database),
            ("postgresql://", Protocol::Database),
            ("postgres://", Protocol::Database),
            ("mongodb://", Protocol::Database),
            ("mongo://", Protocol::Database),
            ("grpc://", Protocol::Grpc),
            ("grpcs://", Protocol::Grpc),
        ];
        for (prefix, protocol) in SCHEMES {
            if lower.starts_with(prefix) {
                return *protocol;
            }
        }
        Protocol::Http
    }

    fn credit(&self, record: &ResponseRecord) {
        self.metrics.record(record.response_time_us, record.success);
        self.percentiles.record_us(record.response_time_us);
    }

    fn finish(&self, record: ResponseRecord) -> ResponseRecord {
        self.credit(&record);
        record
    }

    /// Execute one descriptor: detect the protocol from the URL scheme,
    /// route to the adapter, stamp the protocol, credit metrics.
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
    ) -> Result<ResponseRecord, EngineError> {
        request.validate()?;
        let protocol = Self::detect_protocol(&request.url);
        debug!(url = %request.url, protocol = protocol.label(), method = %request.method, "Dispatching request");

        let record = match protocol {
            Protocol::Http => self.http.execute(request).await,
            Protocol::WebSocket => self.route_websocket(request).await?,
            Protocol::Tcp => self.route_tcp(request).await?,
            Protocol::Udp => self.route_udp(request).await?,
            Protocol::Database => self.route_database(request).await?,
            Protocol::Grpc => {
                return Err(EngineError::ProtocolError(
                    "gRPC dispatch is reserved".to_string(),
                ))
            }
            Protocol::Mqtt => {
                return Err(EngineError::InvalidArgument(
                    "MQTT is dispatched by explicit method, not URL scheme".to_string(),
                ))
            }
        };

        Ok(self.finish(record))
    }

    async fn route_websocket(
        &self,
        request: &RequestDescriptor,
    ) -> Result<ResponseRecord, EngineError> {
        let (subprotocol, ping_interval) = match &request.payload {
            ProtocolPayload::WebSocket {
                subprotocol,
                ping_interval,
            } => (subprotocol.as_str(), *ping_interval),
            _ => ("", None),
        };

        match request.method.to_uppercase().as_str() {
            "CONNECT" => {
                self.websocket
                    .connect(&request.url, subprotocol, ping_interval, request.timeout)
                    .await
            }
            "SEND" => {
                self.websocket
                    .send(&request.url, &request.body, request.timeout)
                    .await
            }
            "RECEIVE" => self.websocket.receive(&request.url, request.timeout).await,
            "CLOSE" | "DISCONNECT" => self.websocket.close(&request.url).await,
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported WebSocket method: {other}"
            ))),
        }
    }

    async fn route_tcp(&self, request: &RequestDescriptor) -> Result<ResponseRecord, EngineError> {
        let (host, port) = endpoint_from_url(&request.url, Protocol::Tcp)?;
        match request.method.to_uppercase().as_str() {
            "CONNECT" => self.tcp.connect(&host, port).await,
            "SEND" => self.tcp.send(&host, port, request.body.as_bytes()).await,
            "RECEIVE" => self.tcp.receive(&host, port).await,
            "CLOSE" | "DISCONNECT" => self.tcp.disconnect(&host, port).await,
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported TCP method: {other}"
            ))),
        }
    }

    async fn route_udp(&self, request: &RequestDescriptor) -> Result<ResponseRecord, EngineError> {
        let (host, port) = endpoint_from_url(&request.url, Protocol::Udp)?;
        match request.method.to_uppercase().as_str() {
            "CREATE" | "CONNECT" => self.udp.create_endpoint(&host, port).await,
            "SEND" => self.udp.send(&host, port, request.body.as_bytes()).await,
            "RECEIVE" => self.udp.receive(&host, port).await,
            "CLOSE" | "DISCONNECT" => self.udp.close(&host, port).await,
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported UDP method: {other}"
            ))),
        }
    }

    async fn route_database(
        &self,
        request: &RequestDescriptor,
    ) -> Result<ResponseRecord, EngineError> {
        let (connection_string, query) = match &request.payload {
            ProtocolPayload::Database {
                connection_string,
                query,
                ..
            } => (connection_string.clone(), query.clone()),
            // Without a payload the URL itself is the connection string.
            _ => (request.url.clone(), request.body.clone()),
        };

        match request.method.to_uppercase().as_str() {
            "CONNECT" => self.database.connect(&connection_string).await,
            "QUERY" => self.database.query(&connection_string, &query).await,
            "CLOSE" | "DISCONNECT" => self.database.disconnect(&connection_string).await,
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported database method: {other}"
            ))),
        }
    }

    // ── WebSocket entry points ─────────────────────────────────────────

    pub async fn ws_connect(
        &self,
        url: &str,
        subprotocol: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self
            .websocket
            .connect(url, subprotocol, None, timeout)
            .await?;
        Ok(self.finish(record))
    }

    pub async fn ws_send(
        &self,
        url: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.websocket.send(url, message, timeout).await?;
        Ok(self.finish(record))
    }

    pub async fn ws_close(&self, url: &str) -> Result<ResponseRecord, EngineError> {
        let record = self.websocket.close(url).await?;
        Ok(self.finish(record))
    }

    // ── TCP entry points ───────────────────────────────────────────────

    pub async fn tcp_connect(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let record = self.tcp.connect(host, port).await?;
        Ok(self.finish(record))
    }

    pub async fn tcp_send(
        &self,
        host: &str,
        port: u16,
        data: &[u8],
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.tcp.send(host, port, data).await?;
        Ok(self.finish(record))
    }

    pub async fn tcp_receive(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let record = self.tcp.receive(host, port).await?;
        Ok(self.finish(record))
    }

    pub async fn tcp_disconnect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.tcp.disconnect(host, port).await?;
        Ok(self.finish(record))
    }

    // ── UDP entry points ───────────────────────────────────────────────

    pub async fn udp_create_endpoint(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.udp.create_endpoint(host, port).await?;
        Ok(self.finish(record))
    }

    pub async fn udp_send(
        &self,
        host: &str,
        port: u16,
        data: &[u8],
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.udp.send(host, port, data).await?;
        Ok(self.finish(record))
    }

    pub async fn udp_receive(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let record = self.udp.receive(host, port).await?;
        Ok(self.finish(record))
    }

    pub async fn udp_close(&self, host: &str, port: u16) -> Result<ResponseRecord, EngineError> {
        let record = self.udp.close(host, port).await?;
        Ok(self.finish(record))
    }

    // ── MQTT entry points (method dispatch, no URL scheme) ─────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive_s: u16,
        timeout: Duration,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self
            .mqtt
            .connect(host, port, client_id, username, password, keep_alive_s, timeout)
            .await?;
        Ok(self.finish(record))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self
            .mqtt
            .publish(host, port, client_id, topic, payload, qos, retain)
            .await?;
        Ok(self.finish(record))
    }

    pub async fn mqtt_subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: u8,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.mqtt.subscribe(host, port, client_id, topic, qos).await?;
        Ok(self.finish(record))
    }

    pub async fn mqtt_unsubscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.mqtt.unsubscribe(host, port, client_id, topic).await?;
        Ok(self.finish(record))
    }

    pub async fn mqtt_disconnect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.mqtt.disconnect(host, port, client_id).await?;
        Ok(self.finish(record))
    }

    // ── Database entry points ──────────────────────────────────────────

    pub async fn db_connect(&self, connection_string: &str) -> Result<ResponseRecord, EngineError> {
        let record = self.database.connect(connection_string).await?;
        Ok(self.finish(record))
    }

    pub async fn db_query(
        &self,
        connection_string: &str,
        query: &str,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.database.query(connection_string, query).await?;
        Ok(self.finish(record))
    }

    pub async fn db_disconnect(
        &self,
        connection_string: &str,
    ) -> Result<ResponseRecord, EngineError> {
        let record = self.database.disconnect(connection_string).await?;
        Ok(self.finish(record))
    }

    /// Release every connection and session. The engine stays usable.
    pub fn teardown(&self) {
        self.websocket.clear();
        self.tcp.clear();
        self.udp.clear();
        self.mqtt.clear();
        self.database.clear();
        self.sessions.clear();
        info!("Engine torn down");
    }
}

/// Parse `scheme://host[:port]` into `(host, port)` with the protocol's
/// default port.
fn endpoint_from_url(raw: &str, protocol: Protocol) -> Result<(String, u16), EngineError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| EngineError::InvalidArgument(format!("bad endpoint URL '{raw}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::InvalidArgument(format!("URL '{raw}' has no host")))?
        .to_string();
    let port = parsed.port().unwrap_or_else(|| protocol.default_port());
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_protocol_schemes() {
        assert_eq!(Engine::detect_protocol("http://x"), Protocol::Http);
        assert_eq!(Engine::detect_protocol("https://x"), Protocol::Http);
        assert_eq!(Engine::detect_protocol("WS://x"), Protocol::WebSocket);
        assert_eq!(Engine::detect_protocol("wss://x"), Protocol::WebSocket);
        assert_eq!(Engine::detect_protocol("tcp://x:7"), Protocol::Tcp);
        assert_eq!(Engine::detect_protocol("udp://x:7"), Protocol::Udp);
        assert_eq!(Engine::detect_protocol("mysql://x"), Protocol::Database);
        assert_eq!(Engine::detect_protocol("postgresql://x"), Protocol::Database);
        assert_eq!(Engine::detect_protocol("postgres://x"), Protocol::Database);
        assert_eq!(Engine::detect_protocol("mongodb://x"), Protocol::Database);
        assert_eq!(Engine::detect_protocol("mongo://x"), Protocol::Database);
        assert_eq!(Engine::detect_protocol("grpc://x"), Protocol::Grpc);
        assert_eq!(Engine::detect_protocol("grpcs://x"), Protocol::Grpc);
        // Unknown schemes fall through to HTTP.
        assert_eq!(Engine::detect_protocol("gopher://x"), Protocol::Http);
    }

    #[test]
    fn test_endpoint_from_url_defaults() {
        let (host, port) = endpoint_from_url("tcp://example.com", Protocol::Tcp).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);

        let (host, port) = endpoint_from_url("udp://resolver.local", Protocol::Udp).unwrap();
        assert_eq!(host, "resolver.local");
        assert_eq!(port, 53);

        let (_, port) = endpoint_from_url("tcp://example.com:9000", Protocol::Tcp).unwrap();
        assert_eq!(port, 9000);
    }

    #[tokio::test]
    async fn test_grpc_dispatch_reserved() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let req = RequestDescriptor::get("grpc://service.local/Check");

        let err = engine.execute(&req).await.unwrap_err();
        assert!(matches!(err, EngineError::ProtocolError(_)));
        // Programming faults never advance metrics.
        assert_eq!(engine.metrics_snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_does_not_advance_metrics() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let req = RequestDescriptor::get("");

        assert!(engine.execute(&req).await.is_err());
        assert_eq!(engine.metrics_snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_credits_metrics() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let req = RequestDescriptor::get("http://127.0.0.1:1/")
            .with_timeout(Duration::from_millis(1000));

        let record = engine.execute(&req).await.unwrap();
        assert!(!record.success);
        assert!(!record.error_message.is_empty());

        let snap = engine.metrics_snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_db_dispatch_through_execute() {
        let engine = Engine::new(EngineConfig::default()).unwrap();

        let connect = RequestDescriptor {
            method: "CONNECT".to_string(),
            ..RequestDescriptor::get("mysql://user@db.local/shop")
        };
        let record = engine.execute(&connect).await.unwrap();
        assert!(record.success);
        assert_eq!(record.protocol, Protocol::Database);

        let query = RequestDescriptor {
            method: "QUERY".to_string(),
            body: "SELECT 1".to_string(),
            ..RequestDescriptor::get("mysql://user@db.local/shop")
        };
        let record = engine.execute(&query).await.unwrap();
        assert!(record.success);

        let snap = engine.metrics_snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.successful_requests, 2);
    }

    #[tokio::test]
    async fn test_fresh_engines_have_fresh_state() {
        let a = Engine::new(EngineConfig::default()).unwrap();
        let b = Engine::new(EngineConfig::default()).unwrap();

        a.db_connect("mysql://db.local").await.unwrap();
        assert_eq!(a.metrics_snapshot().total_requests, 1);
        assert_eq!(b.metrics_snapshot().total_requests, 0);
    }
}
