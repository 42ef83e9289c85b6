//! Point-to-point transports to the device.
//!
//! Every transport speaks the same newline-delimited JSON protocol and is
//! owned by exactly one [`CommunicationTask`](crate::core::CommunicationTask),
//! which serializes access so at most one request is ever in flight.
//!
//! Variants:
//! - [`tcp::TcpTransport`]: direct TCP/WiFi with ADB-assisted IP rediscovery
//! - [`adb::AdbTransport`]: loopback TCP through `adb forward`
//! - [`serial::SerialTransport`]: serial shell bootstrapping a netcat tunnel

pub mod adb;
pub mod codec;
pub mod discovery;
pub mod serial;
pub mod socket;
pub mod tcp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use adb::AdbTransport;
pub use discovery::{AdbIpDiscovery, DiscoveryTier, IpDiscovery};
pub use serial::SerialTransport;
pub use socket::{DeviceStream, Dialer, LineSocket, TcpDialer};
pub use tcp::TcpTransport;

use crate::config::SharedConfig;
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::TransportError;
use crate::infra::adb::{AdbCommand, AdbRunner};

/// Transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Serial link with a netcat tunnel.
    Serial,
    /// Direct TCP/WiFi.
    #[serde(alias = "wifi")]
    Tcp,
    /// ADB port forward.
    Adb,
}

impl ConnectionType {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Tcp => "tcp",
            Self::Adb => "adb",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "tcp" | "wifi" => Ok(Self::Tcp),
            "adb" => Ok(Self::Adb),
            other => Err(TransportError::UnsupportedConnection(other.to_string())),
        }
    }
}

/// A session to the device.
///
/// `connect` and `disconnect` are idempotent. `transmit` fails fast with
/// [`TransportError::NotConnected`] when there is no session and never waits
/// longer than the transport's read timeout.
#[async_trait]
pub trait Transport: Send {
    /// Which variant this is.
    fn connection_type(&self) -> ConnectionType;

    /// Whether a session is established.
    fn is_connected(&self) -> bool;

    /// Human-readable address of the current session, e.g. `10.0.0.50:10001`.
    fn endpoint(&self) -> Option<String>;

    /// Cheap probe of whether this transport could connect right now.
    async fn is_available(&mut self) -> bool;

    /// Establish the session. Failure leaves nothing half-open.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one command and read its single response line.
    async fn transmit(
        &mut self,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError>;

    /// Read a follow-up frame of a streaming exchange started by `transmit`.
    async fn next_frame(
        &mut self,
        request: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError>;

    /// Tear the session down.
    async fn disconnect(&mut self);
}

/// Builds transports by connection type.
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be constructed from config.
    fn create(&self, kind: ConnectionType) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory building the real transports from shared configuration.
pub struct DeviceTransportFactory {
    config: SharedConfig,
    adb: Arc<dyn AdbRunner>,
    dialer: Arc<dyn Dialer>,
}

impl DeviceTransportFactory {
    /// Factory using the system `adb` and plain TCP sockets.
    #[must_use]
    pub fn new(config: SharedConfig) -> Self {
        let adb_path = config.device().adb.path;
        Self {
            config,
            adb: Arc::new(AdbCommand::new(adb_path)),
            dialer: Arc::new(TcpDialer),
        }
    }

    /// Replace the adb runner.
    #[must_use]
    pub fn with_adb_runner(mut self, adb: Arc<dyn AdbRunner>) -> Self {
        self.adb = adb;
        self
    }

    /// Replace the socket dialer.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }
}

impl TransportFactory for DeviceTransportFactory {
    fn create(&self, kind: ConnectionType) -> Result<Box<dyn Transport>, TransportError> {
        let device = self.config.device();
        let transport: Box<dyn Transport> = match kind {
            ConnectionType::Serial => Box::new(SerialTransport::new(
                device.serial,
                device.llm_service.port,
            )),
            ConnectionType::Tcp => Box::new(
                TcpTransport::new(self.config.clone(), Arc::clone(&self.dialer))
                    .with_discovery(Box::new(AdbIpDiscovery::new(Arc::clone(&self.adb)))),
            ),
            ConnectionType::Adb => Box::new(AdbTransport::new(
                Arc::clone(&self.adb),
                Arc::clone(&self.dialer),
                &device,
            )),
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_type_parses_aliases() {
        assert_eq!("serial".parse::<ConnectionType>().unwrap(), ConnectionType::Serial);
        assert_eq!("WiFi".parse::<ConnectionType>().unwrap(), ConnectionType::Tcp);
        assert_eq!(" tcp ".parse::<ConnectionType>().unwrap(), ConnectionType::Tcp);
        assert_eq!("adb".parse::<ConnectionType>().unwrap(), ConnectionType::Adb);
        assert!(matches!(
            "bluetooth".parse::<ConnectionType>(),
            Err(TransportError::UnsupportedConnection(_))
        ));
    }

    #[test]
    fn connection_type_serde_accepts_wifi() {
        let kind: ConnectionType = serde_json::from_str("\"wifi\"").unwrap();
        assert_eq!(kind, ConnectionType::Tcp);
        assert_eq!(serde_json::to_string(&ConnectionType::Adb).unwrap(), "\"adb\"");
    }

    #[test]
    fn factory_builds_each_variant_disconnected() {
        let factory = DeviceTransportFactory::new(SharedConfig::new(Default::default()));
        for kind in [ConnectionType::Serial, ConnectionType::Tcp, ConnectionType::Adb] {
            let transport = factory.create(kind).unwrap();
            assert_eq!(transport.connection_type(), kind);
            assert!(!transport.is_connected());
        }
    }
}
