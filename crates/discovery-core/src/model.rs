use landrop_core::Peer;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str, //ipv4 or ipv6
    pub is_loopback: bool,
    /// Subnet-directed broadcast address, IPv4 only.
    pub broadcast: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastMode {
    /// One datagram to 255.255.255.255.
    Global,
    /// One subnet-directed datagram per active interface.
    PerInterface,
}

impl Default for BroadcastMode {
    fn default() -> Self {
        // Windows does not reliably route the limited broadcast address out
        // of every adapter.
        if cfg!(windows) {
            BroadcastMode::PerInterface
        } else {
            BroadcastMode::Global
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Fixed UDP port shared by every instance
    pub discovery_port: u16,

    pub broadcast_interval_ms: u64,

    /// How often stale peers are swept
    pub cleanup_interval_ms: u64,

    /// A peer not heard from for longer than this is dropped
    pub peer_timeout_ms: u64,

    /// How often the shared folder is rescanned for the advertised list
    pub rescan_interval_ms: u64,

    #[serde(default)]
    pub broadcast_mode: BroadcastMode,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_port: 12346,
            broadcast_interval_ms: 5_000,
            cleanup_interval_ms: 10_000,
            peer_timeout_ms: 15_000,
            rescan_interval_ms: 10_000,
            broadcast_mode: BroadcastMode::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

/// Who "we" are on the network. Messages matching either field are our own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalIdentity {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

impl LocalIdentity {
    pub fn new(hostname: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses: addresses.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    /// Hostname from the OS plus every address bound to a local interface.
    pub fn detect() -> Self {
        let hostname = hostname::get().map_or_else(
            |_| "Unknown".to_string(),
            |h| h.to_string_lossy().to_string(),
        );

        let addresses = match crate::net::list_interface_ips_result() {
            Ok(ifs) => ifs.into_iter().map(|i| i.ip).collect(),
            Err(e) => {
                tracing::warn!("Failed to list interfaces: {}", e);
                Vec::new()
            }
        };

        Self::new(hostname, addresses)
    }

    pub fn matches(&self, ip: IpAddr, hostname: &str) -> bool {
        let ip = ip.to_canonical();
        self.addresses.contains(&ip) || self.hostname == hostname
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeersUpdated(Vec<Peer>),
    Started,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_matches_ip_or_hostname() {
        let me = LocalIdentity::new("desk", vec!["192.168.1.10".parse().unwrap()]);

        assert!(me.matches("192.168.1.10".parse().unwrap(), "other"));
        assert!(me.matches("192.168.1.99".parse().unwrap(), "desk"));
        assert!(me.matches("::ffff:192.168.1.10".parse().unwrap(), "other"));
        assert!(!me.matches("192.168.1.99".parse().unwrap(), "laptop"));
    }

    #[test]
    fn test_config_defaults() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.discovery_port, 12346);
        assert_eq!(cfg.broadcast_interval(), Duration::from_secs(5));
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(10));
        assert_eq!(cfg.peer_timeout(), Duration::from_secs(15));

        let json = serde_json::to_string(&cfg).unwrap();
        let back: DiscoveryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.broadcast_mode, cfg.broadcast_mode);
    }
}
