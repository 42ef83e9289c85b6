//! Device IP rediscovery over ADB.
//!
//! When the configured IP stops answering (new DHCP lease), the device is
//! asked for its current address through a series of tiers. The TCP
//! transport tries each candidate as soon as it is found.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::infra::adb::{parse_device_serials, AdbRunner};

/// Where a candidate address comes from, in the order tiers are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryTier {
    /// `ip addr show wlan0`.
    Wlan0,
    /// `ip addr show eth0`.
    Eth0,
    /// Full interface dump (`ifconfig`, then `ip addr`).
    InterfaceDump,
    /// `ip:port` hint in `adb devices -l`.
    DeviceList,
}

impl DiscoveryTier {
    /// All tiers in trial order.
    pub const ALL: [Self; 4] = [Self::Wlan0, Self::Eth0, Self::InterfaceDump, Self::DeviceList];
}

impl fmt::Display for DiscoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Wlan0 => "wlan0",
            Self::Eth0 => "eth0",
            Self::InterfaceDump => "interface-dump",
            Self::DeviceList => "adb-device-list",
        })
    }
}

/// Source of candidate device addresses.
#[async_trait]
pub trait IpDiscovery: Send {
    /// Bring up whatever side channel discovery needs. `false` skips discovery.
    async fn prepare(&mut self) -> bool {
        true
    }

    /// Candidate address from one tier, if that tier yields one.
    async fn discover(&mut self, tier: DiscoveryTier) -> Option<Ipv4Addr>;
}

/// Discovery through the device's ADB shell.
pub struct AdbIpDiscovery {
    adb: Arc<dyn AdbRunner>,
}

impl AdbIpDiscovery {
    /// Discovery using `adb`.
    #[must_use]
    pub fn new(adb: Arc<dyn AdbRunner>) -> Self {
        Self { adb }
    }

    async fn shell_ip(&self, command: &str) -> Option<Ipv4Addr> {
        match self.adb.shell(command).await {
            Ok(out) => parse_inet_addr(&out),
            Err(e) => {
                debug!(command, error = %e, "Discovery shell command failed");
                None
            }
        }
    }
}

#[async_trait]
impl IpDiscovery for AdbIpDiscovery {
    async fn prepare(&mut self) -> bool {
        if let Err(e) = self.adb.run(&["start-server"]).await {
            warn!(error = %e, "adb server unavailable for IP discovery");
            return false;
        }
        match self.adb.run(&["devices"]).await {
            Ok(out) => !parse_device_serials(&out).is_empty(),
            Err(_) => false,
        }
    }

    async fn discover(&mut self, tier: DiscoveryTier) -> Option<Ipv4Addr> {
        match tier {
            DiscoveryTier::Wlan0 => self.shell_ip("ip addr show wlan0").await,
            DiscoveryTier::Eth0 => self.shell_ip("ip addr show eth0").await,
            DiscoveryTier::InterfaceDump => match self.shell_ip("ifconfig").await {
                Some(ip) => Some(ip),
                None => self.shell_ip("ip addr").await,
            },
            DiscoveryTier::DeviceList => self
                .adb
                .run(&["devices", "-l"])
                .await
                .ok()
                .and_then(|out| parse_device_list_ip(&out)),
        }
    }
}

/// First routable IPv4 address after an `inet` token. Handles both
/// `inet 10.0.0.5/24` (iproute2) and `inet addr:10.0.0.5` (busybox ifconfig).
#[must_use]
pub fn parse_inet_addr(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "inet" {
            continue;
        }
        let Some(value) = tokens.next() else {
            break;
        };
        let value = value.strip_prefix("addr:").unwrap_or(value);
        let value = value.split('/').next().unwrap_or(value);
        if let Ok(ip) = value.parse::<Ipv4Addr>() {
            if is_routable(ip) {
                return Some(ip);
            }
        }
    }
    None
}

/// Address part of the first `ip:port` serial in `adb devices -l` output.
#[must_use]
pub fn parse_device_list_ip(output: &str) -> Option<Ipv4Addr> {
    output
        .split_whitespace()
        .filter_map(|token| token.split_once(':'))
        .filter(|(_, port)| port.parse::<u16>().is_ok())
        .filter_map(|(host, _)| host.parse::<Ipv4Addr>().ok())
        .find(|ip| is_routable(*ip))
}

fn is_routable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR_WLAN0: &str = "3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n\
        link/ether 00:11:22:33:44:55 brd ff:ff:ff:ff:ff:ff\n\
        inet 10.0.0.50/24 brd 10.0.0.255 scope global wlan0\n\
        inet6 fe80::211:22ff:fe33:4455/64 scope link\n";

    const BUSYBOX_IFCONFIG: &str = "lo        Link encap:Local Loopback\n\
        inet addr:127.0.0.1  Mask:255.0.0.0\n\
        eth0      Link encap:Ethernet  HWaddr 00:11:22:33:44:55\n\
        inet addr:192.168.4.20  Bcast:192.168.4.255  Mask:255.255.255.0\n";

    #[test]
    fn parses_iproute2_output() {
        assert_eq!(parse_inet_addr(IP_ADDR_WLAN0), Some(Ipv4Addr::new(10, 0, 0, 50)));
    }

    #[test]
    fn parses_busybox_ifconfig_and_skips_loopback() {
        assert_eq!(
            parse_inet_addr(BUSYBOX_IFCONFIG),
            Some(Ipv4Addr::new(192, 168, 4, 20))
        );
        assert_eq!(parse_inet_addr("inet 127.0.0.1/8 scope host lo"), None);
        assert_eq!(parse_inet_addr("Device \"wlan0\" does not exist."), None);
    }

    #[test]
    fn parses_device_list_hint() {
        let out = "List of devices attached\n\
                   10.0.0.77:5555         device product:m5 model:LLM transport_id:2\n";
        assert_eq!(parse_device_list_ip(out), Some(Ipv4Addr::new(10, 0, 0, 77)));
        assert_eq!(
            parse_device_list_ip("List of devices attached\nabc123  device usb:1-1\n"),
            None
        );
    }

    #[test]
    fn tiers_are_ordered_most_specific_first() {
        assert_eq!(DiscoveryTier::ALL[0], DiscoveryTier::Wlan0);
        assert_eq!(DiscoveryTier::ALL[3], DiscoveryTier::DeviceList);
        assert_eq!(DiscoveryTier::InterfaceDump.to_string(), "interface-dump");
    }
}
