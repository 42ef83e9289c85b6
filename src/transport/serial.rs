//! Serial transport bridging to the device's TCP service through netcat.
//!
//! The serial cable only reaches the device's login shell. `connect` scripts
//! that shell into running a netcat listener, and every command is then sent
//! as `echo '<json>' | nc localhost <port>`; the reply appears on the console
//! between echoed shell noise, which is skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::codec::parse_response_line;
use super::{ConnectionType, Transport};
use crate::config::SerialSettings;
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::TransportError;
use crate::infra::serial_link::{SerialIo, SerialLink};
use crate::util::abbreviate;

/// USB VID:PID of the CH340 bridge on the device's USB-serial port.
pub const CH340_VID_PID: (u16, u16) = (0x1A86, 0x7523);

const DEVICE_DESCRIPTION_HINTS: [&str; 6] =
    ["m5stack", "m5 module", "m5module", "cp210x", "silicon labs", "ch340"];

const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// A serial port visible to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// OS port name.
    pub name: String,
    /// USB VID:PID, when the port is a USB adapter.
    pub usb_id: Option<(u16, u16)>,
    /// Manufacturer and product strings.
    pub description: String,
}

/// Lists and opens serial ports.
pub trait PortOpener: Send + Sync {
    /// Ports currently visible.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serial` if enumeration fails.
    fn available_ports(&self) -> Result<Vec<PortCandidate>, TransportError>;

    /// Open `name` at `baud`, 8N1.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serial` if the port cannot be opened.
    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn SerialIo>, TransportError>;
}

/// [`PortOpener`] backed by the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn available_ports(&self) -> Result<Vec<PortCandidate>, TransportError> {
        let ports =
            serialport::available_ports().map_err(|e| TransportError::Serial(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortCandidate {
                    name: p.port_name,
                    usb_id: Some((usb.vid, usb.pid)),
                    description: format!(
                        "{} {}",
                        usb.manufacturer.unwrap_or_default(),
                        usb.product.unwrap_or_default()
                    ),
                },
                _ => PortCandidate {
                    description: p.port_name.clone(),
                    name: p.port_name,
                    usb_id: None,
                },
            })
            .collect())
    }

    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn SerialIo>, TransportError> {
        let port = serialport::new(name, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Serial(format!("{name}: {e}")))?;
        Ok(Box::new(port))
    }
}

/// Whether a port looks like the device's USB-serial bridge.
#[must_use]
pub fn looks_like_device(candidate: &PortCandidate) -> bool {
    if candidate.usb_id == Some(CH340_VID_PID) {
        return true;
    }
    let desc = candidate.description.to_ascii_lowercase();
    DEVICE_DESCRIPTION_HINTS.iter().any(|hint| desc.contains(hint))
        || (desc.contains("usb") && desc.contains("cdc"))
}

/// Serial transport with an on-device netcat tunnel.
pub struct SerialTransport {
    settings: SerialSettings,
    service_port: u16,
    opener: Arc<dyn PortOpener>,
    link: Option<SerialLink>,
    port_name: Option<String>,
    tunnel_active: bool,
}

impl SerialTransport {
    /// Transport using the system's serial ports.
    #[must_use]
    pub fn new(settings: SerialSettings, service_port: u16) -> Self {
        Self::with_opener(settings, service_port, Arc::new(SystemPorts))
    }

    /// Transport using a custom port opener.
    #[must_use]
    pub fn with_opener(
        settings: SerialSettings,
        service_port: u16,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        Self {
            settings,
            service_port,
            opener,
            link: None,
            port_name: None,
            tunnel_active: false,
        }
    }

    /// Port the session runs on.
    #[must_use]
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.settings.settle_delay_ms)
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.response_timeout_secs)
    }

    fn resolve_port(&self) -> Result<String, TransportError> {
        if !self.settings.port.eq_ignore_ascii_case("auto") {
            return Ok(self.settings.port.clone());
        }
        self.opener
            .available_ports()?
            .into_iter()
            .find(looks_like_device)
            .map(|c| c.name)
            .ok_or_else(|| TransportError::Serial("no device-like serial port found".into()))
    }

    /// Read until a JSON response arrives or the budget runs out.
    async fn read_response(
        link: &mut SerialLink,
        request: &CommandEnvelope,
        budget: Duration,
        correlate: bool,
    ) -> Result<ResponseEnvelope, TransportError> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(budget));
            }
            let line = match link.read_line(remaining).await {
                Err(TransportError::Timeout(_)) => return Err(TransportError::Timeout(budget)),
                other => other?,
            };
            match parse_response_line(&line, request) {
                Some(resp)
                    if correlate
                        && !resp.request_id.is_empty()
                        && resp.request_id != request.request_id =>
                {
                    warn!(got = %resp.request_id, "Discarding stale serial response");
                }
                Some(resp) => return Ok(resp),
                None => debug!(line = %abbreviate(&line), "Skipping shell output"),
            }
        }
    }
}

/// Send one shell line and collect what the shell printed within `settle`,
/// minus the echoed command itself.
async fn shell(
    link: &mut SerialLink,
    command: &str,
    settle: Duration,
) -> Result<Vec<String>, TransportError> {
    link.drain();
    link.write_line(command)?;
    tokio::time::sleep(settle).await;
    if link.is_closed() {
        return Err(TransportError::Serial(format!("{}: link closed", link.name())));
    }
    let output: Vec<String> = link
        .drain()
        .into_iter()
        .filter(|line| !line.trim_end().ends_with(command))
        .collect();
    debug!(command, lines = output.len(), "Shell step");
    Ok(output)
}

/// Script the device shell into listening on `port` and verify it.
async fn bootstrap_tunnel(
    link: &mut SerialLink,
    port: u16,
    settle: Duration,
) -> Result<(), TransportError> {
    let whoami = shell(link, "whoami", settle).await?;
    if whoami.is_empty() {
        return Err(TransportError::Tunnel("no shell response on serial link".into()));
    }
    debug!(user = %whoami[0], "Shell access confirmed");

    let nc = shell(link, "which nc", settle).await?;
    if !nc
        .iter()
        .any(|l| l.contains("nc") && !l.contains("not found"))
    {
        return Err(TransportError::Tunnel("netcat not available on device".into()));
    }

    let probe = format!("netstat -tln | grep {port}");
    let before = shell(link, &probe, settle).await?;
    if !before.is_empty() {
        debug!(port, "Stale listener present before bootstrap");
    }
    shell(link, "pkill -f 'nc -l'", settle).await?;
    shell(link, &format!("nc -l -p {port} 2>&1 &"), settle * 2).await?;

    let needle = format!(":{port}");
    let after = shell(link, &probe, settle).await?;
    if after.iter().any(|l| l.contains(&needle)) {
        Ok(())
    } else {
        Err(TransportError::Tunnel(format!(
            "listener on port {port} not detected"
        )))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Serial
    }

    fn is_connected(&self) -> bool {
        self.tunnel_active && self.link.as_ref().is_some_and(|l| !l.is_closed())
    }

    fn endpoint(&self) -> Option<String> {
        self.is_connected()
            .then(|| format!("127.0.0.1:{}", self.service_port))
    }

    async fn is_available(&mut self) -> bool {
        let Ok(name) = self.resolve_port() else {
            return false;
        };
        match self.opener.available_ports() {
            Ok(ports) if !ports.is_empty() => ports.iter().any(|p| p.name == name),
            _ => true,
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.disconnect().await;
        let name = self.resolve_port()?;
        let io = self.opener.open(&name, self.settings.baud_rate)?;
        let mut link = SerialLink::spawn(io, name.clone())?;
        let settle = self.settle();
        if let Err(e) = bootstrap_tunnel(&mut link, self.service_port, settle).await {
            warn!(port = %name, error = %e, "Tunnel bootstrap failed");
            link.shutdown();
            return Err(e);
        }
        info!(port = %name, service_port = self.service_port, "Serial tunnel established");
        self.link = Some(link);
        self.port_name = Some(name);
        self.tunnel_active = true;
        Ok(())
    }

    async fn transmit(
        &mut self,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let budget = self.response_timeout();
        let json = serde_json::to_string(command)?;
        debug!(body = %abbreviate(&json), "SEND");
        let line = format!(
            "echo '{}' | nc localhost {}",
            json.replace('\'', r"'\''"),
            self.service_port
        );
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        link.drain();
        link.write_line(&line)?;
        Self::read_response(link, command, budget, true).await
    }

    async fn next_frame(
        &mut self,
        request: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        let budget = self.response_timeout();
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        Self::read_response(link, request, budget, false).await
    }

    async fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if self.tunnel_active {
                if let Err(e) = link.write_line("pkill -f 'nc -l'") {
                    debug!(error = %e, "Could not stop the device-side listener");
                }
                tokio::time::sleep(self.settle()).await;
            }
            // Joining the I/O thread blocks, keep it off the async workers.
            if let Err(e) = tokio::task::spawn_blocking(move || link.shutdown()).await {
                warn!(port = ?self.port_name, error = %e, "Serial I/O shutdown failed");
            }
            info!(port = ?self.port_name, "Serial transport disconnected");
        }
        self.tunnel_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read, Write};

    #[derive(Default)]
    struct ShellState {
        output: VecDeque<u8>,
        pending: Vec<u8>,
        listening: bool,
    }

    /// A device shell answering the bootstrap script and echo|nc commands.
    #[derive(Clone, Default)]
    struct FakeShell {
        state: Arc<Mutex<ShellState>>,
        has_netcat: bool,
        garbled: bool,
    }

    impl FakeShell {
        fn respond(&self, line: &str) -> Vec<String> {
            let mut state = self.state.lock();
            let mut out = vec![line.to_string()];
            if line == "whoami" {
                out.push("root".into());
            } else if line == "which nc" {
                out.push(if self.has_netcat { "/usr/bin/nc" } else { "sh: nc: not found" }.into());
            } else if line.starts_with("netstat") && state.listening {
                out.push("tcp        0      0 0.0.0.0:10001           0.0.0.0:*               LISTEN".into());
            } else if line.starts_with("nc -l") {
                state.listening = true;
            } else if line.starts_with("echo '") && self.garbled {
                out.push(r#"{"request_id": broken json"#.into());
            } else if let Some(rest) = line.strip_prefix("echo '") {
                let json = rest.split("' | nc").next().unwrap_or_default();
                let cmd: CommandEnvelope = serde_json::from_str(json).unwrap();
                out.push(format!(
                    "{{\"request_id\":\"{}\",\"work_id\":\"sys\",\"error\":{{\"code\":0,\"message\":\"\"}},\"data\":\"{}\"}}",
                    cmd.request_id, cmd.action
                ));
            }
            out
        }
    }

    impl Read for FakeShell {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(b) = self.state.lock().output.pop_front() {
                buf[0] = b;
                return Ok(1);
            }
            std::thread::sleep(Duration::from_millis(1));
            Err(std::io::Error::new(ErrorKind::TimedOut, "idle"))
        }
    }

    impl Write for FakeShell {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            for b in data {
                if *b == b'\n' {
                    let line = {
                        let mut state = self.state.lock();
                        String::from_utf8(std::mem::take(&mut state.pending)).unwrap()
                    };
                    for reply in self.respond(&line) {
                        let mut state = self.state.lock();
                        state.output.extend(reply.as_bytes());
                        state.output.push_back(b'\n');
                    }
                } else {
                    self.state.lock().pending.push(*b);
                }
            }
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeOpener(FakeShell);

    impl PortOpener for FakeOpener {
        fn available_ports(&self) -> Result<Vec<PortCandidate>, TransportError> {
            Ok(vec![
                PortCandidate {
                    name: "/dev/ttyS0".into(),
                    usb_id: None,
                    description: "/dev/ttyS0".into(),
                },
                PortCandidate {
                    name: "/dev/ttyUSB0".into(),
                    usb_id: Some(CH340_VID_PID),
                    description: "QinHeng USB Serial".into(),
                },
            ])
        }

        fn open(&self, _name: &str, _baud: u32) -> Result<Box<dyn SerialIo>, TransportError> {
            Ok(Box::new(self.0.clone()))
        }
    }

    fn transport(has_netcat: bool) -> SerialTransport {
        shell_transport(FakeShell {
            has_netcat,
            ..FakeShell::default()
        })
    }

    fn shell_transport(shell: FakeShell) -> SerialTransport {
        let settings = SerialSettings {
            settle_delay_ms: 30,
            ..SerialSettings::default()
        };
        SerialTransport::with_opener(settings, 10001, Arc::new(FakeOpener(shell)))
    }

    #[test]
    fn device_ports_are_recognized() {
        let ch340 = PortCandidate {
            name: "COM7".into(),
            usb_id: Some(CH340_VID_PID),
            description: String::new(),
        };
        let m5 = PortCandidate {
            name: "COM3".into(),
            usb_id: Some((0x10c4, 0xea60)),
            description: "Silicon Labs CP210x USB to UART Bridge".into(),
        };
        let other = PortCandidate {
            name: "COM1".into(),
            usb_id: None,
            description: "Communications Port".into(),
        };
        assert!(looks_like_device(&ch340));
        assert!(looks_like_device(&m5));
        assert!(!looks_like_device(&other));
    }

    #[tokio::test]
    async fn bootstraps_tunnel_and_exchanges_commands() {
        let mut t = transport(true);
        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(t.port_name(), Some("/dev/ttyUSB0"));
        assert_eq!(t.endpoint().as_deref(), Some("127.0.0.1:10001"));

        let cmd = CommandEnvelope::hwinfo();
        let resp = t.transmit(&cmd).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.request_id, cmd.request_id);
        assert_eq!(resp.data, serde_json::json!("hwinfo"));

        t.disconnect().await;
        t.disconnect().await;
        assert!(!t.is_connected());
        assert!(matches!(
            t.transmit(&cmd).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn missing_netcat_fails_connect_cleanly() {
        let mut t = transport(false);
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Tunnel(_)));
        assert!(!t.is_connected());
        assert!(t.endpoint().is_none());
    }

    #[tokio::test]
    async fn corrupted_frame_comes_back_as_parse_error_without_waiting() {
        let mut t = shell_transport(FakeShell {
            has_netcat: true,
            garbled: true,
            ..FakeShell::default()
        });
        t.connect().await.unwrap();

        let cmd = CommandEnvelope::hwinfo();
        let started = std::time::Instant::now();
        let resp = t.transmit(&cmd).await.unwrap();
        assert!(started.elapsed() < t.response_timeout());
        assert_eq!(resp.error_code(), -1);
        assert!(resp.error_message().starts_with("Invalid JSON response"));
        assert_eq!(resp.request_id, cmd.request_id);
        assert!(t.is_connected());
        t.disconnect().await;
    }
}
