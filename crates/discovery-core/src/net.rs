use std::io::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use if_addrs::IfAddr;

use crate::model::{BroadcastMode, InterfaceIp};

/// Adapter name fragments of virtual or container networks that are never a
/// useful place to look for peers.
const VIRTUAL_ADAPTERS: &[&str] = &[
    "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "virtualbox", "vmware", "hyper-v",
    "vethernet", "utun", "tun", "tap",
];

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let family = if ip.is_ipv4() { "ipv4" } else { "ipv6" };
            let is_loopback = ifa.is_loopback();
            let broadcast = match &ifa.addr {
                IfAddr::V4(v4) => v4
                    .broadcast
                    .or_else(|| Some(subnet_broadcast(v4.ip, v4.netmask))),
                IfAddr::V6(_) => None,
            };

            InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
                broadcast,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

pub fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

pub fn is_virtual_adapter(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VIRTUAL_ADAPTERS.iter().any(|v| name.contains(v))
}

/// Active, non-loopback IPv4 interfaces that are not virtual adapters.
pub fn lan_interfaces(ifs: &[InterfaceIp]) -> Vec<&InterfaceIp> {
    ifs.iter()
        .filter(|i| i.ip.is_ipv4() && !i.is_loopback && !is_virtual_adapter(&i.name))
        .collect()
}

/// The address other machines most likely know us by.
pub fn local_ipv4(ifs: &[InterfaceIp]) -> Option<Ipv4Addr> {
    lan_interfaces(ifs).into_iter().find_map(|i| match i.ip {
        IpAddr::V4(v4) if !v4.is_link_local() => Some(v4),
        _ => None,
    })
}

/// Where a discovery broadcast should go. Per-interface mode falls back to
/// the global address when no interface qualifies.
pub fn broadcast_targets(mode: BroadcastMode, ifs: &[InterfaceIp], port: u16) -> Vec<SocketAddr> {
    let global = SocketAddr::from((Ipv4Addr::BROADCAST, port));
    if mode == BroadcastMode::Global {
        return vec![global];
    }

    let mut targets: Vec<SocketAddr> = lan_interfaces(ifs)
        .into_iter()
        .filter_map(|i| i.broadcast)
        .map(|b| SocketAddr::from((b, port)))
        .collect();
    targets.sort();
    targets.dedup();

    if targets.is_empty() {
        targets.push(global);
    }
    targets
}
