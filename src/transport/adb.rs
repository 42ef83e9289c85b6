//! ADB port-forward transport.
//!
//! `adb forward tcp:L tcp:R` maps a host port onto the device's service
//! port; the session itself is then plain loopback TCP. A failed exchange
//! marks the forward ("gateway") inactive so the next call rebuilds it
//! instead of reusing a broken mapping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::socket::{Dialer, LineSocket};
use super::{ConnectionType, Transport};
use crate::config::DeviceConfig;
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::TransportError;
use crate::infra::adb::{parse_device_serials, AdbRunner};

const LOOPBACK: &str = "127.0.0.1";

async fn has_device(adb: &dyn AdbRunner) -> bool {
    match adb.run(&["devices"]).await {
        Ok(out) => !parse_device_serials(&out).is_empty(),
        Err(e) => {
            debug!(error = %e, "adb devices failed");
            false
        }
    }
}

/// Session to the device through an ADB port forward.
pub struct AdbTransport {
    adb: Arc<dyn AdbRunner>,
    dialer: Arc<dyn Dialer>,
    local_port: u16,
    remote_port: u16,
    connect_timeout: Duration,
    response_timeout: Duration,
    restart_delays: (Duration, Duration),
    socket: Option<LineSocket>,
    connected: bool,
    gateway_active: bool,
}

impl AdbTransport {
    /// Transport using the `adb` and `llm_service` sections of `device`.
    #[must_use]
    pub fn new(adb: Arc<dyn AdbRunner>, dialer: Arc<dyn Dialer>, device: &DeviceConfig) -> Self {
        Self {
            adb,
            dialer,
            local_port: device.adb.local_port,
            remote_port: device.adb.remote_port,
            connect_timeout: Duration::from_secs(device.llm_service.connect_timeout_secs),
            response_timeout: Duration::from_secs(device.llm_service.response_timeout_secs),
            restart_delays: (Duration::from_secs(1), Duration::from_secs(2)),
            socket: None,
            connected: false,
            gateway_active: false,
        }
    }

    /// Waits after `kill-server` and after `start-server` when restarting adb.
    #[must_use]
    pub const fn with_restart_delays(mut self, after_kill: Duration, after_start: Duration) -> Self {
        self.restart_delays = (after_kill, after_start);
        self
    }

    /// Whether the port forward is believed to be healthy.
    #[must_use]
    pub const fn gateway_active(&self) -> bool {
        self.gateway_active
    }

    fn local_spec(&self) -> String {
        format!("tcp:{}", self.local_port)
    }

    async fn remove_forward(&mut self) {
        let local = self.local_spec();
        if let Err(e) = self.adb.run(&["forward", "--remove", &local]).await {
            debug!(forward = %local, error = %e, "No forward to remove");
        }
        self.gateway_active = false;
    }

    async fn establish_forward(&mut self) -> Result<(), TransportError> {
        let local = self.local_spec();
        let remote = format!("tcp:{}", self.remote_port);
        self.remove_forward().await;
        self.adb.run(&["forward", &local, &remote]).await?;
        let listed = self.adb.run(&["forward", "--list"]).await?;
        if !listed.contains(&local) {
            return Err(TransportError::Adb(format!(
                "forward {local} missing from `adb forward --list`"
            )));
        }
        self.gateway_active = true;
        debug!(local = %local, remote = %remote, "Port forward established");
        Ok(())
    }

    /// Build the forward and open the loopback session, undoing the forward
    /// on any failure.
    async fn open_gateway(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.establish_forward().await {
            self.remove_forward().await;
            return Err(e);
        }
        let opened = LineSocket::open(
            self.dialer.as_ref(),
            LOOPBACK,
            self.local_port,
            self.connect_timeout,
        )
        .await;
        match opened {
            Ok(socket) => {
                self.socket = Some(socket);
                Ok(())
            }
            Err(e) => {
                self.remove_forward().await;
                Err(e)
            }
        }
    }

    fn mark_broken(&mut self, err: &TransportError) {
        warn!(error = %err, "ADB gateway marked inactive");
        self.gateway_active = false;
        self.socket = None;
    }
}

#[async_trait]
impl Transport for AdbTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Adb
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn endpoint(&self) -> Option<String> {
        self.connected.then(|| format!("{LOOPBACK}:{}", self.local_port))
    }

    async fn is_available(&mut self) -> bool {
        if let Err(e) = self.adb.run(&["start-server"]).await {
            warn!(error = %e, "adb start-server failed");
        }
        if has_device(self.adb.as_ref()).await {
            return true;
        }
        warn!("No ADB device listed, restarting adb server");
        if let Err(e) = self.adb.run(&["kill-server"]).await {
            debug!(error = %e, "adb kill-server failed");
        }
        self.gateway_active = false;
        tokio::time::sleep(self.restart_delays.0).await;
        if let Err(e) = self.adb.run(&["start-server"]).await {
            debug!(error = %e, "adb start-server failed after restart");
        }
        tokio::time::sleep(self.restart_delays.1).await;
        has_device(self.adb.as_ref()).await
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        if !self.is_available().await {
            return Err(TransportError::ConnectionFailed(
                "no ADB device attached".to_string(),
            ));
        }
        self.open_gateway().await?;
        self.connected = true;
        info!(endpoint = %format!("{LOOPBACK}:{}", self.local_port), "ADB transport connected");
        Ok(())
    }

    async fn transmit(
        &mut self,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.gateway_active || self.socket.is_none() {
            info!("Re-establishing ADB gateway");
            self.socket = None;
            self.open_gateway().await?;
        }
        let result = match self.socket.as_mut() {
            Some(socket) => socket.exchange(command, self.response_timeout).await,
            None => Err(TransportError::NotConnected),
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    async fn next_frame(
        &mut self,
        request: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        let result = match self.socket.as_mut() {
            Some(socket) => socket.recv_any(request, self.response_timeout).await,
            None => Err(TransportError::NotConnected),
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    async fn disconnect(&mut self) {
        self.socket = None;
        if self.connected || self.gateway_active {
            self.remove_forward().await;
        }
        if self.connected {
            self.connected = false;
            info!("ADB transport disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::socket::DeviceStream;
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[derive(Default)]
    struct FakeAdb {
        calls: Mutex<Vec<String>>,
        forwards: Mutex<Vec<String>>,
        no_devices: bool,
        server_broken: bool,
    }

    #[async_trait]
    impl AdbRunner for FakeAdb {
        async fn run(&self, args: &[&str]) -> Result<String, TransportError> {
            let joined = args.join(" ");
            self.calls.lock().push(joined.clone());
            match args {
                ["kill-server" | "start-server"] if self.server_broken => {
                    Err(TransportError::Adb(format!("{joined}: daemon not running")))
                }
                ["devices", ..] if self.no_devices => Ok("List of devices attached\n\n".into()),
                ["devices", ..] => Ok("List of devices attached\nm5llm\tdevice\n".into()),
                ["forward", "--list"] => Ok(self
                    .forwards
                    .lock()
                    .iter()
                    .map(|f| format!("m5llm {f} tcp:10001\n"))
                    .collect()),
                ["forward", "--remove", local] => {
                    self.forwards.lock().retain(|f| f != local);
                    Ok(String::new())
                }
                ["forward", local, _remote] => {
                    self.forwards.lock().push((*local).to_string());
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        }
    }

    /// Each dial yields a device that answers exactly one request, then hangs up.
    struct OneShotDevice;

    #[async_trait]
    impl Dialer for OneShotDevice {
        async fn dial(
            &self,
            host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<Box<dyn DeviceStream>, TransportError> {
            assert_eq!(host, LOOPBACK);
            let (client, device) = duplex(4096);
            tokio::spawn(async move {
                let mut reader = BufReader::new(device);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    let cmd: CommandEnvelope = serde_json::from_str(line.trim()).unwrap();
                    let reply = format!(
                        "{{\"request_id\":\"{}\",\"error\":{{\"code\":0,\"message\":\"\"}}}}\n",
                        cmd.request_id
                    );
                    let _ = reader.get_mut().write_all(reply.as_bytes()).await;
                }
            });
            Ok(Box::new(client))
        }
    }

    fn transport(adb: Arc<FakeAdb>) -> AdbTransport {
        AdbTransport::new(adb, Arc::new(OneShotDevice), &DeviceConfig::default())
            .with_restart_delays(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn connect_forwards_and_disconnect_removes() {
        let adb = Arc::new(FakeAdb::default());
        let mut t = transport(Arc::clone(&adb));

        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert!(t.gateway_active());
        assert_eq!(t.endpoint().as_deref(), Some("127.0.0.1:10001"));
        assert_eq!(adb.forwards.lock().as_slice(), ["tcp:10001".to_string()]);

        t.disconnect().await;
        t.disconnect().await;
        assert!(!t.is_connected());
        assert!(adb.forwards.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_exchange_rebuilds_gateway_on_next_call() {
        let adb = Arc::new(FakeAdb::default());
        let mut t = transport(Arc::clone(&adb));
        t.connect().await.unwrap();

        assert!(t.transmit(&CommandEnvelope::hwinfo()).await.unwrap().is_success());
        // The fake device hung up after one answer.
        let err = t.transmit(&CommandEnvelope::hwinfo()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::EmptyResponse | TransportError::Io(_)
        ));
        assert!(!t.gateway_active());

        let resp = t.transmit(&CommandEnvelope::hwinfo()).await.unwrap();
        assert!(resp.is_success());
        assert!(t.gateway_active());
        let forwards = adb
            .calls
            .lock()
            .iter()
            .filter(|c| c.as_str() == "forward tcp:10001 tcp:10001")
            .count();
        assert_eq!(forwards, 2);
    }

    #[tokio::test]
    async fn no_device_restarts_server_then_fails() {
        let adb = Arc::new(FakeAdb {
            no_devices: true,
            ..FakeAdb::default()
        });
        let mut t = transport(Arc::clone(&adb));
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(!t.is_connected());
        assert!(adb.calls.lock().iter().any(|c| c == "kill-server"));
        assert!(adb.forwards.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_server_commands_still_end_in_connection_failed() {
        let adb = Arc::new(FakeAdb {
            no_devices: true,
            server_broken: true,
            ..FakeAdb::default()
        });
        let mut t = transport(Arc::clone(&adb));
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        let calls = adb.calls.lock();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "start-server").count(), 2);
        assert_eq!(calls.iter().filter(|c| c.as_str() == "kill-server").count(), 1);
        assert_eq!(calls.last().map(String::as_str), Some("devices"));
    }
}
