//! Direct TCP/WiFi transport with IP rediscovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::discovery::{DiscoveryTier, IpDiscovery};
use super::socket::{Dialer, LineSocket};
use super::{ConnectionType, Transport};
use crate::config::SharedConfig;
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::TransportError;

/// Opens and verifies sessions to one service port.
#[derive(Clone)]
struct Prober {
    dialer: Arc<dyn Dialer>,
    port: u16,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Prober {
    async fn open(&self, host: &str) -> Result<LineSocket, TransportError> {
        LineSocket::open(self.dialer.as_ref(), host, self.port, self.connect_timeout).await
    }

    /// Open a session and require a successful ping on it.
    async fn probe(&self, host: &str) -> Result<LineSocket, TransportError> {
        let mut socket = self.open(host).await?;
        let resp = socket
            .exchange(&CommandEnvelope::ping(), self.response_timeout)
            .await?;
        if resp.is_success() {
            Ok(socket)
        } else {
            Err(TransportError::ConnectionFailed(format!(
                "ping to {host}:{} failed: {}",
                self.port,
                resp.error_message()
            )))
        }
    }
}

async fn walk_tiers(
    prober: &Prober,
    stale_host: &str,
    discovery: &mut dyn IpDiscovery,
) -> Option<(String, LineSocket)> {
    if !discovery.prepare().await {
        warn!("IP discovery unavailable");
        return None;
    }
    for tier in DiscoveryTier::ALL {
        let Some(ip) = discovery.discover(tier).await else {
            debug!(%tier, "No candidate from discovery tier");
            continue;
        };
        let candidate = ip.to_string();
        if candidate == stale_host {
            continue;
        }
        info!(%tier, ip = %candidate, "Trying discovered device IP");
        match prober.probe(&candidate).await {
            Ok(socket) => return Some((candidate, socket)),
            Err(e) => debug!(ip = %candidate, error = %e, "Discovered IP did not answer"),
        }
    }
    None
}

/// Session to the device's LLM service over TCP.
///
/// `connect` only succeeds once the service answers a `ping`. If the
/// configured host does not, discovery tiers are walked and the first
/// candidate that answers is adopted and persisted to configuration.
pub struct TcpTransport {
    config: SharedConfig,
    prober: Prober,
    discovery: Option<Box<dyn IpDiscovery>>,
    host: String,
    socket: Option<LineSocket>,
    connected: bool,
}

impl TcpTransport {
    /// Transport targeting the configured `llm_service` endpoint.
    #[must_use]
    pub fn new(config: SharedConfig, dialer: Arc<dyn Dialer>) -> Self {
        let service = config.device().llm_service;
        Self {
            config,
            prober: Prober {
                dialer,
                port: service.port,
                connect_timeout: Duration::from_secs(service.connect_timeout_secs),
                response_timeout: Duration::from_secs(service.response_timeout_secs),
            },
            discovery: None,
            host: service.ip,
            socket: None,
            connected: false,
        }
    }

    /// Enable IP rediscovery when the configured host is unreachable.
    #[must_use]
    pub fn with_discovery(mut self, discovery: Box<dyn IpDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Current target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn rediscover(&mut self) -> Option<(String, LineSocket)> {
        let mut discovery = self.discovery.take()?;
        let found = walk_tiers(&self.prober, &self.host, discovery.as_mut()).await;
        self.discovery = Some(discovery);
        found
    }

    async fn exchange_once(
        &mut self,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if self.socket.is_none() {
            self.socket = Some(self.prober.open(&self.host).await?);
        }
        let result = match self.socket.as_mut() {
            Some(socket) => socket.exchange(command, self.prober.response_timeout).await,
            None => Err(TransportError::NotConnected),
        };
        if result.is_err() {
            self.socket = None;
        }
        result
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn endpoint(&self) -> Option<String> {
        self.connected
            .then(|| format!("{}:{}", self.host, self.prober.port))
    }

    async fn is_available(&mut self) -> bool {
        tokio::net::lookup_host((self.host.as_str(), self.prober.port))
            .await
            .is_ok_and(|mut addrs| addrs.next().is_some())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        let host = self.host.clone();
        let first_error = match self.prober.probe(&host).await {
            Ok(socket) => {
                self.socket = Some(socket);
                self.connected = true;
                info!(endpoint = %format!("{host}:{}", self.prober.port), "TCP transport connected");
                return Ok(());
            }
            Err(e) => e,
        };
        warn!(host = %host, port = self.prober.port, error = %first_error, "Configured device IP unreachable");

        let Some((ip, socket)) = self.rediscover().await else {
            return Err(TransportError::ConnectionFailed(format!(
                "{host}:{} unreachable and no other address answered: {first_error}",
                self.prober.port
            )));
        };
        let config = self.config.clone();
        let persisted = ip.clone();
        match tokio::task::spawn_blocking(move || config.persist_device_ip(&persisted)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(ip = %ip, error = %e, "Could not persist discovered IP"),
            Err(e) => warn!(ip = %ip, error = %e, "Persisting discovered IP panicked"),
        }
        self.host = ip;
        self.socket = Some(socket);
        self.connected = true;
        info!(
            endpoint = %format!("{}:{}", self.host, self.prober.port),
            "TCP transport connected after rediscovery"
        );
        Ok(())
    }

    async fn transmit(
        &mut self,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.exchange_once(command).await {
            Err(
                e @ (TransportError::Io(_)
                | TransportError::ConnectionClosed
                | TransportError::EmptyResponse),
            ) => {
                debug!(error = %e, "Session dropped, retrying on a fresh socket");
                self.exchange_once(command).await
            }
            other => other,
        }
    }

    async fn next_frame(
        &mut self,
        request: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let result = socket.recv_any(request, self.prober.response_timeout).await;
        if result.is_err() {
            self.socket = None;
        }
        result
    }

    async fn disconnect(&mut self) {
        self.socket = None;
        if self.connected {
            self.connected = false;
            info!(host = %self.host, port = self.prober.port, "TCP transport disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::transport::socket::DeviceStream;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Dialer whose every session is a fake device answering with success.
    struct AnsweringDialer;

    #[async_trait]
    impl Dialer for AnsweringDialer {
        async fn dial(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<Box<dyn DeviceStream>, TransportError> {
            let (client, device) = duplex(4096);
            tokio::spawn(async move {
                let mut reader = BufReader::new(device);
                let mut line = String::new();
                while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    let cmd: CommandEnvelope = serde_json::from_str(line.trim()).unwrap();
                    let reply = serde_json::json!({
                        "request_id": cmd.request_id,
                        "work_id": cmd.work_id,
                        "error": {"code": 0, "message": ""},
                        "data": cmd.action,
                    });
                    let mut out = reply.to_string();
                    out.push('\n');
                    reader.get_mut().write_all(out.as_bytes()).await.unwrap();
                    line.clear();
                }
            });
            Ok(Box::new(client))
        }
    }

    fn transport() -> TcpTransport {
        let mut device = DeviceConfig::default();
        device.llm_service.ip = "192.168.1.10".into();
        TcpTransport::new(SharedConfig::new(device), Arc::new(AnsweringDialer))
    }

    #[tokio::test]
    async fn transmit_before_connect_fails_fast() {
        let mut t = transport();
        let err = t.transmit(&CommandEnvelope::hwinfo()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(t.endpoint().is_none());
    }

    #[tokio::test]
    async fn connect_verifies_with_ping_and_is_idempotent() {
        let mut t = transport();
        t.connect().await.unwrap();
        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(t.endpoint().as_deref(), Some("192.168.1.10:10001"));

        let resp = t.transmit(&CommandEnvelope::hwinfo()).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.data, serde_json::json!("hwinfo"));

        t.disconnect().await;
        t.disconnect().await;
        assert!(!t.is_connected());
    }
}
