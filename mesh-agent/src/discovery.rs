//! Host identification for mesh agents
//!
//! - Primary interface detection with priority (Ethernet > WiFi > Other)
//! - Network interface enumeration with IPv4 and MAC addresses
//! - System identification (hostname, OS, architecture)

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub primary_ip: Option<String>,
    pub primary_mac: Option<String>,
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub network: NetworkInfo,
}

impl SystemInfo {
    pub fn discover() -> Result<Self> {
        let network = NetworkInfo::discover().context("Failed to discover network information")?;
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let os = std::env::consts::OS.to_string();
        let architecture = std::env::consts::ARCH.to_string();

        info!(
            "Discovery complete - Hostname: {}, OS: {}/{}, IP: {}",
            hostname,
            os,
            architecture,
            network.primary_ip.as_deref().unwrap_or("unknown")
        );

        Ok(SystemInfo {
            hostname,
            os,
            architecture,
            network,
        })
    }
}

impl NetworkInfo {
    /// Enumerate IPv4 interfaces (loopback excluded) and pick the primary one
    pub fn discover() -> Result<Self> {
        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let interfaces: Vec<NetworkInterface> = if_addrs
            .into_iter()
            .filter(|i| !i.is_loopback())
            .filter_map(|i| match i.addr {
                IfAddr::V4(v4) => Some(NetworkInterface {
                    mac: interface_mac(&i.name),
                    interface_type: classify_interface(&i.name),
                    ip: v4.ip.to_string(),
                    name: i.name,
                }),
                IfAddr::V6(_) => None,
            })
            .collect();

        for interface in &interfaces {
            debug!(
                "Found interface: {} {} ({})",
                interface.name,
                interface.ip,
                interface.mac.as_deref().unwrap_or("no mac")
            );
        }

        let primary = select_primary(&interfaces);
        if primary.is_none() {
            warn!("No usable IPv4 interface found");
        }

        Ok(NetworkInfo {
            primary_ip: primary.map(|i| i.ip.clone()),
            primary_mac: primary.and_then(|i| i.mac.clone()),
            interfaces,
        })
    }
}

fn interface_mac(name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(name) {
        Ok(Some(mac)) => {
            let b = mac.bytes();
            Some(format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ))
        }
        Ok(None) => None,
        Err(e) => {
            debug!("Error getting MAC for {}: {}", name, e);
            None
        }
    }
}

/// Classify interface type based on name patterns
fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") || name.starts_with("lo:") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wifi", "wlp", "wlo"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Wireless;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

/// Ethernet first, then WiFi, then anything; interfaces with a MAC win ties
fn select_primary(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    let rank = |i: &NetworkInterface| {
        let kind = match i.interface_type {
            InterfaceType::Ethernet => 0,
            InterfaceType::Wireless => 1,
            InterfaceType::Other => 2,
            InterfaceType::Loopback => 3,
        };
        (kind, i.mac.is_none())
    };
    interfaces.iter().min_by_key(|&i| rank(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, mac: Option<&str>, ip: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.into(),
            mac: mac.map(Into::into),
            ip: ip.into(),
            interface_type: classify_interface(name),
        }
    }

    #[test]
    fn test_interface_classification() {
        assert_eq!(classify_interface("eth0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("enp3s0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("wlan0"), InterfaceType::Wireless);
        assert_eq!(classify_interface("wlo1"), InterfaceType::Wireless);
        assert_eq!(classify_interface("lo"), InterfaceType::Loopback);
        assert_eq!(classify_interface("docker0"), InterfaceType::Other);
    }

    #[test]
    fn test_ethernet_preferred_over_wifi() {
        let interfaces = vec![
            iface("docker0", Some("02:42:ac:11:00:01"), "172.17.0.1"),
            iface("wlan0", Some("a1:b2:c3:d4:e5:f6"), "192.168.1.30"),
            iface("eth0", Some("b8:27:eb:00:00:01"), "192.168.1.20"),
        ];
        let primary = select_primary(&interfaces).unwrap();
        assert_eq!(primary.name, "eth0");
    }

    #[test]
    fn test_interface_with_mac_wins_tie() {
        let interfaces = vec![
            iface("eth1", None, "10.0.0.5"),
            iface("eth0", Some("b8:27:eb:00:00:01"), "192.168.1.20"),
        ];
        assert_eq!(select_primary(&interfaces).unwrap().ip, "192.168.1.20");
        assert!(select_primary(&[]).is_none());
    }
}
